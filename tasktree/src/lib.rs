//! Task orchestration core for agent-driven work.
//!
//! A workspace holds a tree of planning and execution nodes. The crate gives
//! each node a lifecycle, rebuilds the knowledge an agent needs for a node,
//! and can delegate one execution node at a time to an isolated worker whose
//! changes are committed, verified, rolled back or merged through git.
//!
//! - **[`core`]**: Pure, deterministic logic (transition tables, cascades,
//!   creation rules, context aggregation, invariants). No I/O.
//! - **[`io`]**: Side effects (graph files, git, config, brief rendering).
//!
//! [`service`] and [`dispatch`] combine both behind [`Orchestrator`], which
//! serializes writes per workspace and holds the project dispatch lock.

pub mod core;
pub mod dispatch;
pub mod error;
pub mod exit_codes;
pub mod graph;
pub mod io;
pub mod logging;
pub mod service;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;

pub use error::{Error, Result};
pub use service::Orchestrator;
