//! Stable exit codes for tasktree CLI commands.

use crate::error::Error;

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, layout, config or stored graph, or another I/O failure.
pub const INVALID: i32 = 1;
/// The lifecycle rules rejected the request (transition, parent, dispatch state).
pub const REJECTED: i32 = 2;
/// Another dispatch holds the project, or a merge stopped on conflicts.
pub const CONFLICT: i32 = 3;

/// Map a typed error to its exit code.
pub fn for_error(err: &Error) -> i32 {
    if err.is_conflict() {
        CONFLICT
    } else if err.is_rejection() {
        REJECTED
    } else {
        INVALID
    }
}
