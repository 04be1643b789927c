//! Transition tables for planning and execution nodes, plus cascade planning.
//!
//! Planning is pure: [`plan_transition`] inspects a graph snapshot and returns
//! the full list of status changes (primary + cascade). [`apply_transition`]
//! writes that plan into a graph copy; callers persist the copy in one write.

use chrono::{DateTime, Utc};

use super::types::{Action, CascadeEntry, CascadeReason, Hint, TransitionOutcome};
use crate::error::{Error, Result};
use crate::graph::{ExecutionStatus, Graph, PlanningStatus, Status};

/// Execution table. `None` means the action is not allowed from `from`.
pub fn execution_next(from: ExecutionStatus, action: Action) -> Option<ExecutionStatus> {
    use ExecutionStatus as S;
    match (from, action) {
        (S::Pending, Action::Start) => Some(S::Implementing),
        (S::Implementing, Action::Submit) => Some(S::Validating),
        (S::Implementing | S::Validating, Action::Complete) => Some(S::Completed),
        (S::Implementing | S::Validating, Action::Fail) => Some(S::Failed),
        (S::Failed, Action::Retry) => Some(S::Implementing),
        (S::Completed, Action::Reopen) => Some(S::Implementing),
        _ => None,
    }
}

/// Planning table. The `planning -> monitoring` edge is system-driven and has
/// no caller action.
pub fn planning_next(from: PlanningStatus, action: Action) -> Option<PlanningStatus> {
    use PlanningStatus as S;
    match (from, action) {
        (S::Pending, Action::Start) => Some(S::Planning),
        (S::Planning | S::Monitoring, Action::Complete) => Some(S::Completed),
        (S::Planning | S::Monitoring, Action::Cancel) => Some(S::Cancelled),
        (S::Completed | S::Cancelled, Action::Reopen) => Some(S::Planning),
        _ => None,
    }
}

/// Compute the outcome of `action` on `node_id` without mutating anything.
///
/// Check order: transition table, conclusion, child completion.
pub fn plan_transition(
    graph: &Graph,
    node_id: &str,
    action: Action,
    conclusion: Option<&str>,
) -> Result<TransitionOutcome> {
    let node = graph.require(node_id)?;
    let previous = node.status();
    let next = match previous {
        Status::Execution(status) => execution_next(status, action).map(Status::Execution),
        Status::Planning(status) => planning_next(status, action).map(Status::Planning),
    }
    .ok_or_else(|| Error::invalid_transition(node_id, previous, action.as_str()))?;

    let conclusion = normalize_conclusion(conclusion);
    if action.requires_conclusion() && conclusion.is_none() {
        return Err(Error::ConclusionRequired {
            node_id: node_id.to_string(),
            action: action.as_str().to_string(),
        });
    }

    if next == Status::Planning(PlanningStatus::Completed) {
        let unfinished: Vec<String> = graph
            .children_of(node_id)
            .into_iter()
            .filter(|child| !child.is_terminal())
            .map(|child| child.id.clone())
            .collect();
        if !unfinished.is_empty() {
            return Err(Error::IncompleteChildren {
                node_id: node_id.to_string(),
                children: unfinished,
            });
        }
    }

    let cascade = if next == Status::Execution(ExecutionStatus::Implementing) {
        ancestor_cascade(graph, node_id)
    } else {
        Vec::new()
    };

    let hint = match (previous, action) {
        (Status::Planning(_), Action::Reopen) if !node.children.is_empty() => {
            Some(Hint::ExistingChildren {
                children: node.children.clone(),
            })
        }
        _ => None,
    };

    Ok(TransitionOutcome {
        node_id: node_id.to_string(),
        action,
        previous_status: previous,
        current_status: next,
        conclusion: if next.is_terminal() { conclusion } else { None },
        cascade,
        hint,
    })
}

/// Status changes that bring every planning ancestor of `node_id` to
/// `monitoring`, nearest ancestor first.
pub fn ancestor_cascade(graph: &Graph, node_id: &str) -> Vec<CascadeEntry> {
    use PlanningStatus as S;
    let mut cascade = Vec::new();
    for ancestor in graph.ancestors(node_id) {
        let Status::Planning(status) = ancestor.status() else {
            continue;
        };
        let steps: &[(S, S)] = match status {
            S::Pending => &[(S::Pending, S::Planning), (S::Planning, S::Monitoring)],
            S::Planning => &[(S::Planning, S::Monitoring)],
            S::Completed => &[(S::Completed, S::Monitoring)],
            S::Monitoring | S::Cancelled => &[],
        };
        for (from, to) in steps {
            cascade.push(CascadeEntry {
                node_id: ancestor.id.clone(),
                from: Status::Planning(*from),
                to: Status::Planning(*to),
                reason: CascadeReason::DescendantStarted,
            });
        }
    }
    cascade
}

/// Write a planned transition (primary node + cascade) into `graph`.
pub fn apply_transition(
    graph: &mut Graph,
    outcome: &TransitionOutcome,
    now: DateTime<Utc>,
) -> Result<()> {
    let node = graph.require_mut(&outcome.node_id)?;
    node.set_status(outcome.current_status)?;
    node.conclusion = outcome.conclusion.clone();
    node.updated_at = now;
    apply_cascade(graph, &outcome.cascade, now)
}

/// Apply cascade entries in order. Cascades only enter non-terminal statuses,
/// so every touched node loses its conclusion.
pub(crate) fn apply_cascade(
    graph: &mut Graph,
    cascade: &[CascadeEntry],
    now: DateTime<Utc>,
) -> Result<()> {
    for entry in cascade {
        let node = graph.require_mut(&entry.node_id)?;
        node.set_status(entry.to)?;
        if !entry.to.is_terminal() {
            node.conclusion = None;
        }
        node.updated_at = now;
    }
    Ok(())
}

fn normalize_conclusion(conclusion: Option<&str>) -> Option<String> {
    conclusion
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
