//! Shared deterministic types for the orchestration core.
//!
//! These types define the contracts between the state machine, the creation
//! rules and the orchestrator. They carry no I/O and serialize stably.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::graph::Status;

/// Lifecycle action requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Submit,
    Complete,
    Fail,
    Cancel,
    Retry,
    Reopen,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Submit => "submit",
            Action::Complete => "complete",
            Action::Fail => "fail",
            Action::Cancel => "cancel",
            Action::Retry => "retry",
            Action::Reopen => "reopen",
        }
    }

    /// Terminal actions must carry a non-blank conclusion.
    pub fn requires_conclusion(self) -> bool {
        matches!(self, Action::Complete | Action::Fail | Action::Cancel)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Action::Start),
            "submit" => Ok(Action::Submit),
            "complete" => Ok(Action::Complete),
            "fail" => Ok(Action::Fail),
            "cancel" => Ok(Action::Cancel),
            "retry" => Ok(Action::Retry),
            "reopen" => Ok(Action::Reopen),
            other => Err(format!(
                "unknown action '{other}' (expected start|submit|complete|fail|cancel|retry|reopen)"
            )),
        }
    }
}

/// How the isolation branch is folded back into the base branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Rebase the isolation branch onto the base, then fast-forward.
    #[default]
    Sequential,
    /// Squash every dispatch commit into a single commit on the base.
    Squash,
    /// Apply the isolation commits to the base without committing.
    CherryPick,
    /// Leave the base branch untouched.
    Skip,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStrategy::Sequential => "sequential",
            MergeStrategy::Squash => "squash",
            MergeStrategy::CherryPick => "cherry-pick",
            MergeStrategy::Skip => "skip",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(MergeStrategy::Sequential),
            "squash" => Ok(MergeStrategy::Squash),
            "cherry-pick" => Ok(MergeStrategy::CherryPick),
            "skip" => Ok(MergeStrategy::Skip),
            other => Err(format!(
                "unknown merge strategy '{other}' (expected sequential|squash|cherry-pick|skip)"
            )),
        }
    }
}

/// Why an ancestor changed status as a side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeReason {
    /// An execution descendant entered `implementing`.
    DescendantStarted,
    /// The node acquired a child.
    ChildCreated,
    /// A completed node was reopened to accept new work.
    ImplicitReopen,
}

/// One status change applied to a node other than the primary target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeEntry {
    pub node_id: String,
    pub from: Status,
    pub to: Status,
    pub reason: CascadeReason,
}

/// Advisory information returned next to a successful transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Hint {
    /// A reopened planning node still owns children from its previous round.
    ExistingChildren { children: Vec<String> },
}

/// Planned (or applied) result of one transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub node_id: String,
    pub action: Action,
    pub previous_status: Status,
    pub current_status: Status,
    pub conclusion: Option<String>,
    pub cascade: Vec<CascadeEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<Hint>,
}
