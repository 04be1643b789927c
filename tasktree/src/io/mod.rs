//! Side-effecting helpers: persistence, version control, config and rendering.

pub mod brief;
pub mod config;
pub mod layout;
pub mod store;
pub mod vcs;
