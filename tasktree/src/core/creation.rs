//! Node creation rules: parent checks, implicit reopen and first-child cascade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::validate_id;
use super::state_machine::apply_cascade;
use super::types::{CascadeEntry, CascadeReason};
use crate::error::{Error, Result};
use crate::graph::{Graph, Node, NodeKind, PlanningStatus, Status};

/// Caller-supplied fields for a new node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub problem: Option<String>,
    #[serde(default)]
    pub isolate: bool,
    #[serde(default)]
    pub verified_by: Option<String>,
}

impl NewNode {
    pub fn new(
        id: impl Into<String>,
        kind: NodeKind,
        parent_id: Option<&str>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            parent_id: parent_id.map(str::to_string),
            title: title.into(),
            problem: None,
            isolate: false,
            verified_by: None,
        }
    }
}

/// A validated node plus the status changes its insertion causes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreationPlan {
    pub node: Node,
    pub cascade: Vec<CascadeEntry>,
}

pub fn plan_creation(graph: &Graph, new: NewNode, now: DateTime<Utc>) -> Result<CreationPlan> {
    validate_id(&new.id)?;
    if graph.nodes.contains_key(&new.id) {
        return Err(Error::DuplicateNode(new.id));
    }

    let cascade = match new.parent_id.as_deref() {
        None => {
            if let Some(root_id) = &graph.root_id {
                return Err(Error::RootAlreadyExists(root_id.clone()));
            }
            Vec::new()
        }
        Some(parent_id) => parent_cascade(graph, parent_id)?,
    };

    if let Some(verifier) = new.verified_by.as_deref() {
        validate_verifier(graph, &new, verifier)?;
    }

    let mut node = Node::new(new.id, new.kind, new.parent_id, new.title, now);
    node.problem = new.problem.filter(|text| !text.trim().is_empty());
    node.isolate = new.isolate;
    node.verified_by = new.verified_by;
    Ok(CreationPlan { node, cascade })
}

/// Insert a planned node, link it under its parent and apply the cascade.
pub fn apply_creation(graph: &mut Graph, plan: &CreationPlan, now: DateTime<Utc>) -> Result<()> {
    let node = plan.node.clone();
    match node.parent_id.as_deref() {
        Some(parent_id) => graph.require_mut(parent_id)?.children.push(node.id.clone()),
        None => graph.root_id = Some(node.id.clone()),
    }
    graph.nodes.insert(node.id.clone(), node);
    apply_cascade(graph, &plan.cascade, now)
}

fn parent_cascade(graph: &Graph, parent_id: &str) -> Result<Vec<CascadeEntry>> {
    use PlanningStatus as S;
    let parent = graph.require(parent_id)?;
    let status = match parent.status() {
        Status::Execution(_) => {
            return Err(Error::ExecutionCannotHaveChildren {
                parent_id: parent_id.to_string(),
            });
        }
        Status::Planning(status) => status,
    };

    let entry = |node_id: &str, from: S, to: S, reason: CascadeReason| CascadeEntry {
        node_id: node_id.to_string(),
        from: Status::Planning(from),
        to: Status::Planning(to),
        reason,
    };

    let mut cascade = match status {
        S::Cancelled => {
            return Err(Error::InvalidParentStatus {
                parent_id: parent_id.to_string(),
                status: parent.status(),
            });
        }
        S::Pending | S::Monitoring => Vec::new(),
        S::Planning => vec![entry(parent_id, S::Planning, S::Monitoring, CascadeReason::ChildCreated)],
        S::Completed => vec![
            entry(parent_id, S::Completed, S::Planning, CascadeReason::ImplicitReopen),
            entry(parent_id, S::Planning, S::Monitoring, CascadeReason::ChildCreated),
        ],
    };

    if status == S::Completed {
        for ancestor in graph.ancestors(parent_id) {
            if ancestor.status() == Status::Planning(S::Completed) {
                cascade.push(entry(
                    &ancestor.id,
                    S::Completed,
                    S::Monitoring,
                    CascadeReason::ImplicitReopen,
                ));
            }
        }
    }
    Ok(cascade)
}

fn validate_verifier(graph: &Graph, new: &NewNode, verifier: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidVerifier {
        node_id: new.id.clone(),
        verifier: verifier.to_string(),
        reason: reason.to_string(),
    };
    if new.kind != NodeKind::Execution {
        return Err(invalid("only execution nodes are verified"));
    }
    if verifier == new.id {
        return Err(invalid("a node cannot verify itself"));
    }
    let node = graph.require(verifier)?;
    if node.kind() != NodeKind::Execution {
        return Err(invalid("verifiers must be execution nodes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ExecutionStatus;
    use crate::test_support::{execution_node, fixed_now, graph_of, planning_node};

    fn create(graph: &mut Graph, new: NewNode) -> Result<CreationPlan> {
        let plan = plan_creation(graph, new, fixed_now())?;
        apply_creation(graph, &plan, fixed_now())?;
        Ok(plan)
    }

    #[test]
    fn first_node_becomes_root() {
        let mut graph = Graph::default();
        create(&mut graph, NewNode::new("root", NodeKind::Planning, None, "Root"))
            .expect("create");
        assert_eq!(graph.root_id.as_deref(), Some("root"));

        let err = create(&mut graph, NewNode::new("other", NodeKind::Planning, None, "Other"))
            .expect_err("second root");
        assert_eq!(err.code(), "root_already_exists");
    }

    #[test]
    fn execution_parent_rejects_children() {
        let mut graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            execution_node("e", Some("root"), ExecutionStatus::Pending),
        ]);
        let err = create(
            &mut graph,
            NewNode::new("child", NodeKind::Execution, Some("e"), "Child"),
        )
        .expect_err("reject");
        assert_eq!(err.code(), "execution_cannot_have_children");
        assert!(graph.node("child").is_none());
    }

    #[test]
    fn cancelled_parent_rejects_children() {
        let mut graph = graph_of(vec![planning_node("root", None, PlanningStatus::Cancelled)]);
        let err = create(
            &mut graph,
            NewNode::new("child", NodeKind::Execution, Some("root"), "Child"),
        )
        .expect_err("reject");
        assert_eq!(err.code(), "invalid_parent_status");
    }

    #[test]
    fn first_child_moves_planning_parent_to_monitoring() {
        let mut graph = graph_of(vec![planning_node("root", None, PlanningStatus::Planning)]);
        let plan = create(
            &mut graph,
            NewNode::new("a", NodeKind::Execution, Some("root"), "A"),
        )
        .expect("create");
        assert_eq!(plan.cascade.len(), 1);
        let root = graph.node("root").expect("root");
        assert_eq!(root.status(), Status::Planning(PlanningStatus::Monitoring));
        assert_eq!(root.children, vec!["a"]);
    }

    #[test]
    fn pending_parent_keeps_status() {
        let mut graph = graph_of(vec![planning_node("root", None, PlanningStatus::Pending)]);
        let plan = create(
            &mut graph,
            NewNode::new("a", NodeKind::Planning, Some("root"), "A"),
        )
        .expect("create");
        assert!(plan.cascade.is_empty());
        assert_eq!(
            graph.node("root").expect("root").status(),
            Status::Planning(PlanningStatus::Pending)
        );
    }

    /// A completed parent (and completed ancestors) return to monitoring.
    #[test]
    fn completed_parent_is_implicitly_reopened() {
        let mut graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Completed),
            planning_node("p", Some("root"), PlanningStatus::Completed),
        ]);
        let plan = create(
            &mut graph,
            NewNode::new("new", NodeKind::Execution, Some("p"), "New"),
        )
        .expect("create");
        let reasons: Vec<CascadeReason> = plan.cascade.iter().map(|entry| entry.reason).collect();
        assert_eq!(
            reasons,
            vec![
                CascadeReason::ImplicitReopen,
                CascadeReason::ChildCreated,
                CascadeReason::ImplicitReopen
            ]
        );
        for id in ["root", "p"] {
            let node = graph.node(id).expect(id);
            assert_eq!(node.status(), Status::Planning(PlanningStatus::Monitoring));
            assert_eq!(node.conclusion, None);
        }
    }

    #[test]
    fn verifier_must_be_another_execution_node() {
        let graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            execution_node("check", Some("root"), ExecutionStatus::Pending),
        ]);
        let mut new = NewNode::new("work", NodeKind::Execution, Some("root"), "Work");
        new.verified_by = Some("root".to_string());
        let err = plan_creation(&graph, new.clone(), fixed_now()).expect_err("planning verifier");
        assert_eq!(err.code(), "invalid_verifier");

        new.verified_by = Some("check".to_string());
        let plan = plan_creation(&graph, new, fixed_now()).expect("valid verifier");
        assert_eq!(plan.node.verified_by.as_deref(), Some("check"));
    }

    #[test]
    fn duplicate_and_invalid_ids_are_rejected() {
        let graph = graph_of(vec![planning_node("root", None, PlanningStatus::Planning)]);
        let dup = plan_creation(
            &graph,
            NewNode::new("root", NodeKind::Planning, Some("root"), "Dup"),
            fixed_now(),
        )
        .expect_err("duplicate");
        assert_eq!(dup.code(), "duplicate_node");

        let bad = plan_creation(
            &graph,
            NewNode::new("a/b", NodeKind::Planning, Some("root"), "Bad"),
            fixed_now(),
        )
        .expect_err("invalid");
        assert_eq!(bad.code(), "invalid_id");
    }
}
