//! Identifier rules shared by nodes, documents and workspaces.
//!
//! Ids end up in branch names and file paths, so the alphabet is restricted.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

pub const MAX_ID_LEN: usize = 64;

static ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]*$").expect("id regex should compile")
});

/// Validate an id against the shared alphabet and length bound.
pub fn validate_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        Some("must not be empty".to_string())
    } else if id.len() > MAX_ID_LEN {
        Some(format!("must be at most {MAX_ID_LEN} characters"))
    } else if !ID_RE.is_match(id) {
        Some("use letters, digits, '.', '_' or '-', not starting with '.' or '-'".to_string())
    } else if id.contains("..") {
        Some("must not contain '..'".to_string())
    } else if id.ends_with('.') || id.ends_with(".lock") {
        // git refuses these as ref components
        Some("must not end with '.' or '.lock'".to_string())
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidId {
            id: id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_branch_safe_ids() {
        for id in ["root", "task-1", "v1.2_final", "A", "lock", "w.locked"] {
            validate_id(id).expect(id);
        }
    }

    #[test]
    fn rejects_unsafe_ids() {
        for id in [
            "",
            ".hidden",
            "-flag",
            "a/b",
            "a b",
            "a..b",
            "trailing.",
            "w.lock",
            &"x".repeat(65),
        ] {
            let err = validate_id(id).expect_err(id);
            assert_eq!(err.code(), "invalid_id");
        }
    }
}
