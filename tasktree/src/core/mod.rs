//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! graph snapshots, take the current time as an argument, and return plans or
//! typed errors suitable for tests.

pub mod context;
pub mod creation;
pub mod dispatch;
pub mod edits;
pub mod ids;
pub mod invariants;
pub mod path;
pub mod state_machine;
pub mod types;
