//! Error taxonomy shared by the state machine, the context aggregator and the
//! dispatch engine.
//!
//! Every variant maps to a stable [`Error::code`] that callers (CLI, request
//! handlers) can match on without parsing messages.

use thiserror::Error;

use crate::core::types::MergeStrategy;
use crate::graph::{DispatchStatus, NodeKind, Status};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("node '{node_id}' ({kind}) cannot {action} from status '{status}'")]
    InvalidTransition {
        node_id: String,
        kind: NodeKind,
        status: Status,
        action: String,
    },

    #[error("{action} on node '{node_id}' requires a conclusion")]
    ConclusionRequired { node_id: String, action: String },

    #[error("execution node '{parent_id}' cannot have children")]
    ExecutionCannotHaveChildren { parent_id: String },

    #[error("node '{parent_id}' in status '{status}' does not accept new children")]
    InvalidParentStatus { parent_id: String, status: Status },

    #[error("node '{node_id}' has unfinished children: {}", .children.join(", "))]
    IncompleteChildren {
        node_id: String,
        children: Vec<String>,
    },

    #[error("dispatch is held by workspace '{workspace}'{}", holder_suffix(.node_id.as_deref()))]
    DispatchConcurrencyConflict {
        workspace: String,
        node_id: Option<String>,
    },

    #[error("dispatch is not enabled for workspace '{workspace}'")]
    DispatchNotEnabled { workspace: String },

    #[error("node '{node_id}' has no dispatch in status '{expected}'")]
    DispatchNotPrepared {
        node_id: String,
        expected: DispatchStatus,
    },

    #[error("version control {operation} failed: {message}")]
    VcsOperationFailed { operation: String, message: String },

    #[error("{strategy} merge stopped on conflicts: {}", .files.join(", "))]
    MergeConflict {
        strategy: MergeStrategy,
        files: Vec<String>,
    },

    #[error("node '{verifier}' cannot verify '{node_id}': {reason}")]
    InvalidVerifier {
        node_id: String,
        verifier: String,
        reason: String,
    },

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("node '{node_id}' has no reference to '{target}'")]
    ReferenceNotFound { node_id: String, target: String },

    #[error("document '{0}' not found")]
    DocumentNotFound(String),

    #[error("node '{0}' already exists")]
    DuplicateNode(String),

    #[error("graph already has root '{0}'")]
    RootAlreadyExists(String),

    #[error("invalid id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("node '{node_id}' is a {kind} node and cannot hold status '{status}'")]
    KindMismatch {
        node_id: String,
        kind: NodeKind,
        status: Status,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl Error {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::ConclusionRequired { .. } => "conclusion_required",
            Error::ExecutionCannotHaveChildren { .. } => "execution_cannot_have_children",
            Error::InvalidParentStatus { .. } => "invalid_parent_status",
            Error::IncompleteChildren { .. } => "incomplete_children",
            Error::DispatchConcurrencyConflict { .. } => "dispatch_concurrency_conflict",
            Error::DispatchNotEnabled { .. } => "dispatch_not_enabled",
            Error::DispatchNotPrepared { .. } => "dispatch_not_prepared",
            Error::VcsOperationFailed { .. } => "vcs_operation_failed",
            Error::MergeConflict { .. } => "merge_conflict",
            Error::InvalidVerifier { .. } => "invalid_verifier",
            Error::NodeNotFound(_) => "node_not_found",
            Error::ReferenceNotFound { .. } => "reference_not_found",
            Error::DocumentNotFound(_) => "document_not_found",
            Error::DuplicateNode(_) => "duplicate_node",
            Error::RootAlreadyExists(_) => "root_already_exists",
            Error::InvalidId { .. } => "invalid_id",
            Error::KindMismatch { .. } => "kind_mismatch",
            Error::Storage(_) => "storage",
        }
    }

    /// True for errors raised by lifecycle rules (as opposed to I/O or lookups).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::InvalidTransition { .. }
                | Error::ConclusionRequired { .. }
                | Error::ExecutionCannotHaveChildren { .. }
                | Error::InvalidParentStatus { .. }
                | Error::IncompleteChildren { .. }
                | Error::DispatchNotEnabled { .. }
                | Error::DispatchNotPrepared { .. }
        )
    }

    /// True for errors the caller may resolve by waiting or intervening.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::DispatchConcurrencyConflict { .. } | Error::MergeConflict { .. }
        )
    }

    pub(crate) fn invalid_transition(node_id: &str, status: Status, action: &str) -> Self {
        Error::InvalidTransition {
            node_id: node_id.to_string(),
            kind: status.kind(),
            status,
            action: action.to_string(),
        }
    }
}

fn holder_suffix(node_id: Option<&str>) -> String {
    node_id
        .map(|id| format!(" (active node '{id}')"))
        .unwrap_or_default()
}
