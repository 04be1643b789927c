//! Node records and the per-workspace graph that owns them.
//!
//! A node's status lives inside its type-tagged [`NodeState`], so a planning
//! node can never hold an execution status (and vice versa). Serialized nodes
//! carry `type` and `status` as flat fields next to the rest of the record.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Planning,
    Execution,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Planning => "planning",
            NodeKind::Execution => "execution",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "planning" => Ok(NodeKind::Planning),
            "execution" => Ok(NodeKind::Execution),
            other => Err(format!(
                "unknown node type '{other}' (expected planning|execution)"
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanningStatus {
    Pending,
    Planning,
    Monitoring,
    Completed,
    Cancelled,
}

impl PlanningStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanningStatus::Pending => "pending",
            PlanningStatus::Planning => "planning",
            PlanningStatus::Monitoring => "monitoring",
            PlanningStatus::Completed => "completed",
            PlanningStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PlanningStatus::Completed | PlanningStatus::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Implementing,
    Validating,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Implementing => "implementing",
            ExecutionStatus::Validating => "validating",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

/// A status tagged with the node type it belongs to.
///
/// Serializes as the bare status string (`"monitoring"`, `"failed"`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Status {
    Planning(PlanningStatus),
    Execution(ExecutionStatus),
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Planning(status) => status.as_str(),
            Status::Execution(status) => status.as_str(),
        }
    }

    pub fn kind(self) -> NodeKind {
        match self {
            Status::Planning(_) => NodeKind::Planning,
            Status::Execution(_) => NodeKind::Execution,
        }
    }

    /// Terminal statuses are exactly the ones that carry a conclusion.
    pub fn is_terminal(self) -> bool {
        match self {
            Status::Planning(status) => status.is_terminal(),
            Status::Execution(status) => status.is_terminal(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Pending,
    Executing,
    Testing,
    Passed,
    Failed,
}

impl DispatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::Executing => "executing",
            DispatchStatus::Testing => "testing",
            DispatchStatus::Passed => "passed",
            DispatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DispatchStatus::Passed | DispatchStatus::Failed)
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch bookkeeping attached to an execution node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub use_version_control: bool,
    /// Commit id (version-controlled mode) or RFC 3339 timestamp.
    pub start_marker: String,
    #[serde(default)]
    pub end_marker: Option<String>,
    pub status: DispatchStatus,
    /// Conclusion reported by the worker, held until verification finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_conclusion: Option<String>,
    pub prepared_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl DispatchRecord {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeState {
    Planning {
        status: PlanningStatus,
    },
    Execution {
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dispatch: Option<DispatchRecord>,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    #[default]
    Active,
    Expired,
}

impl LinkStatus {
    pub fn is_active(self) -> bool {
        self == LinkStatus::Active
    }
}

/// Weak, non-owning pointer to another node in the same workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub node_id: String,
    #[serde(default)]
    pub status: LinkStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLink {
    pub document_id: String,
    #[serde(default)]
    pub status: LinkStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub state: NodeState,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(default)]
    pub isolate: bool,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default)]
    pub documents: Vec<DocumentLink>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a node in `pending` with no links.
    pub fn new(
        id: impl Into<String>,
        kind: NodeKind,
        parent_id: Option<String>,
        title: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let state = match kind {
            NodeKind::Planning => NodeState::Planning {
                status: PlanningStatus::Pending,
            },
            NodeKind::Execution => NodeState::Execution {
                status: ExecutionStatus::Pending,
                dispatch: None,
            },
        };
        Self {
            id: id.into(),
            parent_id,
            state,
            title: title.into(),
            problem: None,
            isolate: false,
            children: Vec::new(),
            references: Vec::new(),
            documents: Vec::new(),
            log: Vec::new(),
            conclusion: None,
            verified_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self.state {
            NodeState::Planning { .. } => NodeKind::Planning,
            NodeState::Execution { .. } => NodeKind::Execution,
        }
    }

    pub fn status(&self) -> Status {
        match &self.state {
            NodeState::Planning { status } => Status::Planning(*status),
            NodeState::Execution { status, .. } => Status::Execution(*status),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn dispatch(&self) -> Option<&DispatchRecord> {
        match &self.state {
            NodeState::Execution { dispatch, .. } => dispatch.as_ref(),
            NodeState::Planning { .. } => None,
        }
    }

    pub fn dispatch_mut(&mut self) -> Option<&mut DispatchRecord> {
        match &mut self.state {
            NodeState::Execution { dispatch, .. } => dispatch.as_mut(),
            NodeState::Planning { .. } => None,
        }
    }

    /// Attach a dispatch record. Fails for planning nodes.
    pub fn set_dispatch(&mut self, record: DispatchRecord) -> Result<()> {
        match &mut self.state {
            NodeState::Execution { dispatch, .. } => {
                *dispatch = Some(record);
                Ok(())
            }
            NodeState::Planning { status } => Err(Error::KindMismatch {
                node_id: self.id.clone(),
                kind: NodeKind::Planning,
                status: Status::Planning(*status),
            }),
        }
    }

    /// Replace the status, rejecting a status that belongs to the other node type.
    pub fn set_status(&mut self, next: Status) -> Result<()> {
        match (&mut self.state, next) {
            (NodeState::Planning { status }, Status::Planning(value)) => *status = value,
            (NodeState::Execution { status, .. }, Status::Execution(value)) => *status = value,
            _ => {
                return Err(Error::KindMismatch {
                    node_id: self.id.clone(),
                    kind: self.kind(),
                    status: next,
                });
            }
        }
        Ok(())
    }

    pub fn has_active_dispatch(&self) -> bool {
        self.dispatch().is_some_and(DispatchRecord::is_active)
    }
}

/// The node tree of one workspace plus the documents its nodes link to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub root_id: Option<String>,
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub documents: BTreeMap<String, Document>,
}

impl Graph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn require(&self, id: &str) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    pub fn require_mut(&mut self, id: &str) -> Result<&mut Node> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    /// Ancestors of `id`, nearest first. Stops on a missing parent or a cycle.
    pub fn ancestors(&self, id: &str) -> Vec<&Node> {
        let mut out: Vec<&Node> = Vec::new();
        let mut current = self.nodes.get(id).and_then(|node| node.parent_id.as_deref());
        while let Some(parent_id) = current {
            let Some(parent) = self.nodes.get(parent_id) else {
                break;
            };
            if parent.id == id || out.iter().any(|seen| seen.id == parent.id) {
                break;
            }
            out.push(parent);
            current = parent.parent_id.as_deref();
        }
        out
    }

    /// Direct children of `id` in insertion order, skipping dangling ids.
    pub fn children_of(&self, id: &str) -> Vec<&Node> {
        let Some(node) = self.nodes.get(id) else {
            return Vec::new();
        };
        node.children
            .iter()
            .filter_map(|child| self.nodes.get(child))
            .collect()
    }

    /// The first node holding a non-terminal dispatch record, if any.
    pub fn active_dispatch(&self) -> Option<&Node> {
        self.nodes.values().find(|node| node.has_active_dispatch())
    }
}

/// Project-wide record of which workspace currently has dispatch enabled.
///
/// Its presence in the store is the project's "dispatch enabled" flag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSession {
    pub workspace: String,
    pub use_version_control: bool,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub isolation_branch: Option<String>,
    pub enabled_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{execution_node, fixed_now, graph_of, planning_node};

    #[test]
    fn node_serializes_type_and_status_as_flat_fields() {
        let node = Node::new("n1", NodeKind::Execution, None, "Task", fixed_now());
        let value = serde_json::to_value(&node).expect("serialize");
        assert_eq!(value["type"], "execution");
        assert_eq!(value["status"], "pending");
        assert!(value.get("dispatch").is_none());

        let back: Node = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, node);
    }

    #[test]
    fn set_status_rejects_other_kind() {
        let mut node = Node::new("p", NodeKind::Planning, None, "Plan", fixed_now());
        let err = node
            .set_status(Status::Execution(ExecutionStatus::Implementing))
            .expect_err("kind mismatch");
        assert_eq!(err.code(), "kind_mismatch");
        assert_eq!(node.status(), Status::Planning(PlanningStatus::Pending));
    }

    #[test]
    fn ancestors_are_nearest_first() {
        let graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            planning_node("a", Some("root"), PlanningStatus::Monitoring),
            execution_node("leaf", Some("a"), ExecutionStatus::Pending),
        ]);
        let ids: Vec<&str> = graph
            .ancestors("leaf")
            .iter()
            .map(|node| node.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "root"]);
    }

    #[test]
    fn ancestors_stop_on_cycle() {
        let mut graph = graph_of(vec![
            planning_node("a", None, PlanningStatus::Monitoring),
            planning_node("b", Some("a"), PlanningStatus::Monitoring),
        ]);
        graph.node_mut("a").expect("a").parent_id = Some("b".to_string());
        assert_eq!(graph.ancestors("b").len(), 1);
    }
}
