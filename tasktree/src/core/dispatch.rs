//! Dispatch record lifecycle and naming helpers.
//!
//! `pending -> executing -> testing -> passed | failed`, with
//! `executing -> passed | failed` when no verification phase is needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{DispatchRecord, DispatchStatus, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchEvent {
    /// The work brief was handed to a worker.
    Begin,
    /// The worker finished and a paired verifier takes over.
    Submit,
    Pass,
    Fail,
}

impl DispatchEvent {
    /// The status a record must be in for this event to be accepted first.
    pub fn expected_from(self) -> DispatchStatus {
        match self {
            DispatchEvent::Begin => DispatchStatus::Pending,
            DispatchEvent::Submit | DispatchEvent::Pass | DispatchEvent::Fail => {
                DispatchStatus::Executing
            }
        }
    }
}

pub fn next_dispatch_status(current: DispatchStatus, event: DispatchEvent) -> Option<DispatchStatus> {
    use DispatchStatus as S;
    match (current, event) {
        (S::Pending, DispatchEvent::Begin) => Some(S::Executing),
        (S::Executing, DispatchEvent::Submit) => Some(S::Testing),
        (S::Executing | S::Testing, DispatchEvent::Pass) => Some(S::Passed),
        (S::Executing | S::Testing, DispatchEvent::Fail) => Some(S::Failed),
        _ => None,
    }
}

/// Fresh record in `pending` for a node about to be dispatched.
pub fn new_record(use_version_control: bool, start_marker: String, now: DateTime<Utc>) -> DispatchRecord {
    DispatchRecord {
        use_version_control,
        start_marker,
        end_marker: None,
        status: DispatchStatus::Pending,
        pending_conclusion: None,
        prepared_at: now,
        finished_at: None,
    }
}

/// Advance `record` by `event`, stamping `finished_at` on terminal statuses.
pub fn advance(
    node_id: &str,
    record: &mut DispatchRecord,
    event: DispatchEvent,
    now: DateTime<Utc>,
) -> Result<DispatchStatus> {
    let next = next_dispatch_status(record.status, event).ok_or_else(|| {
        Error::DispatchNotPrepared {
            node_id: node_id.to_string(),
            expected: event.expected_from(),
        }
    })?;
    record.status = next;
    if next.is_terminal() {
        record.finished_at = Some(now);
    }
    Ok(next)
}

/// Branch that holds a workspace's dispatch commits.
pub fn isolation_branch(prefix: &str, workspace: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), workspace)
}

/// Commit message recorded on the isolation branch for a finished unit.
pub fn commit_message(prefix: &str, node: &Node, conclusion: &str) -> String {
    let summary = conclusion.lines().next().unwrap_or_default().trim();
    format!("{prefix}({}): {}\n\n{}", node.id, node.title, summary)
        .trim_end()
        .to_string()
}

/// Commit message for the single commit a squash merge produces.
pub fn merge_message(prefix: &str, workspace: &str) -> String {
    format!("{prefix}: merge dispatch work from workspace {workspace}")
}
