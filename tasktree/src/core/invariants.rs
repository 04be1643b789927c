//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::graph::{DispatchStatus, ExecutionStatus, Graph, Node, NodeKind, Status};

/// Check semantic invariants of one workspace graph:
/// - Map keys match node ids; exactly one root, reachable tree, no cycles
/// - Parent/child links agree in both directions
/// - Execution nodes have no children
/// - `conclusion` is set exactly on terminal statuses
/// - At most one non-terminal dispatch record, in step with its node's status
pub fn validate_graph(graph: &Graph) -> Vec<String> {
    let mut errors = Vec::new();
    if graph.nodes.is_empty() {
        if let Some(root_id) = &graph.root_id {
            errors.push(format!("root '{root_id}' set on an empty graph"));
        }
        return errors;
    }

    for (key, node) in &graph.nodes {
        if key != &node.id {
            errors.push(format!("node stored under '{key}' has id '{}'", node.id));
        }
        validate_links(graph, key, &mut errors);
        if node.kind() == NodeKind::Execution && !node.children.is_empty() {
            errors.push(format!("{key}: execution node has children"));
        }
        match (node.is_terminal(), node.conclusion.is_some()) {
            (true, false) => errors.push(format!(
                "{key}: status '{}' requires a conclusion",
                node.status()
            )),
            (false, true) => errors.push(format!(
                "{key}: status '{}' must not carry a conclusion",
                node.status()
            )),
            _ => {}
        }
        if let Some(record) = node.dispatch().filter(|_| !dispatch_in_step(node)) {
            errors.push(format!(
                "{key}: dispatch '{}' does not match status '{}'",
                record.status,
                node.status()
            ));
        }
        for link in &node.documents {
            if !graph.documents.contains_key(&link.document_id) {
                errors.push(format!("{key}: links missing document '{}'", link.document_id));
            }
        }
    }

    let roots: Vec<&str> = graph
        .nodes
        .values()
        .filter(|node| node.parent_id.is_none())
        .map(|node| node.id.as_str())
        .collect();
    match graph.root_id.as_deref() {
        None => errors.push("graph has nodes but no root_id".to_string()),
        Some(root_id) if roots != [root_id] => errors.push(format!(
            "root_id '{root_id}' does not match parentless nodes [{}]",
            roots.join(", ")
        )),
        Some(root_id) => validate_reachable(graph, root_id, &mut errors),
    }

    let active: Vec<&str> = graph
        .nodes
        .values()
        .filter(|node| node.has_active_dispatch())
        .map(|node| node.id.as_str())
        .collect();
    if active.len() > 1 {
        errors.push(format!(
            "multiple active dispatch records: {}",
            active.join(", ")
        ));
    }

    errors
}

/// An active record pins the node: executing while implementing, testing
/// while validating.
fn dispatch_in_step(node: &Node) -> bool {
    let Some(record) = node.dispatch() else {
        return true;
    };
    let expected = match record.status {
        DispatchStatus::Pending | DispatchStatus::Executing => ExecutionStatus::Implementing,
        DispatchStatus::Testing => ExecutionStatus::Validating,
        DispatchStatus::Passed | DispatchStatus::Failed => return true,
    };
    node.status() == Status::Execution(expected)
}

fn validate_links(graph: &Graph, id: &str, errors: &mut Vec<String>) {
    let Some(node) = graph.node(id) else {
        return;
    };
    if let Some(parent_id) = &node.parent_id {
        match graph.node(parent_id) {
            None => errors.push(format!("{id}: parent '{parent_id}' not found")),
            Some(parent) if !parent.children.contains(&node.id) => {
                errors.push(format!("{id}: parent '{parent_id}' does not list it as a child"));
            }
            Some(_) => {}
        }
    }
    let mut seen = HashSet::new();
    for child_id in &node.children {
        if !seen.insert(child_id) {
            errors.push(format!("{id}: child '{child_id}' listed twice"));
            continue;
        }
        match graph.node(child_id) {
            None => errors.push(format!("{id}: child '{child_id}' not found")),
            Some(child) if child.parent_id.as_deref() != Some(id) => {
                errors.push(format!("{id}: child '{child_id}' points at another parent"));
            }
            Some(_) => {}
        }
    }
}

fn validate_reachable(graph: &Graph, root_id: &str, errors: &mut Vec<String>) {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![root_id];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            errors.push(format!("cycle detected at '{id}'"));
            continue;
        }
        if let Some(node) = graph.node(id) {
            stack.extend(node.children.iter().map(String::as_str));
        }
    }
    let mut unreachable: Vec<&str> = graph
        .nodes
        .keys()
        .map(String::as_str)
        .filter(|id| !visited.contains(id))
        .collect();
    unreachable.sort_unstable();
    if !unreachable.is_empty() {
        errors.push(format!(
            "nodes not reachable from root: {}",
            unreachable.join(", ")
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatch::new_record;
    use crate::graph::{DispatchStatus, ExecutionStatus, PlanningStatus};
    use crate::test_support::{execution_node, fixed_now, graph_of, planning_node};

    #[test]
    fn well_formed_graph_has_no_errors() {
        let graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            execution_node("a", Some("root"), ExecutionStatus::Completed),
            execution_node("b", Some("root"), ExecutionStatus::Pending),
        ]);
        assert_eq!(validate_graph(&graph), Vec::<String>::new());
    }

    #[test]
    fn empty_graph_is_valid() {
        assert!(validate_graph(&Graph::default()).is_empty());
    }

    #[test]
    fn conclusion_must_match_terminal_status() {
        let mut graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            execution_node("a", Some("root"), ExecutionStatus::Failed),
        ]);
        graph.node_mut("a").expect("a").conclusion = None;
        graph.node_mut("root").expect("root").conclusion = Some("stale".to_string());
        let errors = validate_graph(&graph);
        assert_eq!(errors.len(), 2, "{errors:?}");
    }

    #[test]
    fn execution_children_and_broken_links_are_reported() {
        let mut graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            execution_node("a", Some("root"), ExecutionStatus::Pending),
        ]);
        graph.node_mut("a").expect("a").children.push("ghost".to_string());
        let errors = validate_graph(&graph);
        assert!(errors.iter().any(|e| e.contains("execution node has children")));
        assert!(errors.iter().any(|e| e.contains("child 'ghost' not found")));
    }

    #[test]
    fn detached_cycle_is_unreachable() {
        let mut graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            planning_node("x", Some("root"), PlanningStatus::Monitoring),
            planning_node("y", Some("x"), PlanningStatus::Monitoring),
        ]);
        graph.node_mut("root").expect("root").children.clear();
        graph.node_mut("x").expect("x").parent_id = Some("y".to_string());
        graph.node_mut("y").expect("y").children.push("x".to_string());
        let errors = validate_graph(&graph);
        assert!(
            errors.iter().any(|e| e.contains("not reachable from root: x, y")),
            "{errors:?}"
        );
    }

    #[test]
    fn two_active_dispatches_are_rejected() {
        let mut graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            execution_node("a", Some("root"), ExecutionStatus::Implementing),
            execution_node("b", Some("root"), ExecutionStatus::Implementing),
        ]);
        for id in ["a", "b"] {
            let mut record = new_record(false, "t0".to_string(), fixed_now());
            record.status = DispatchStatus::Executing;
            graph
                .node_mut(id)
                .expect(id)
                .set_dispatch(record)
                .expect("dispatch");
        }
        let errors = validate_graph(&graph);
        assert!(errors.iter().any(|e| e.contains("multiple active dispatch records: a, b")));
    }

    #[test]
    fn active_record_must_match_node_status() {
        let mut graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            execution_node("a", Some("root"), ExecutionStatus::Failed),
        ]);
        let mut record = new_record(false, "t0".to_string(), fixed_now());
        record.status = DispatchStatus::Executing;
        graph
            .node_mut("a")
            .expect("a")
            .set_dispatch(record)
            .expect("dispatch");
        let errors = validate_graph(&graph);
        assert!(
            errors
                .iter()
                .any(|e| e.contains("a: dispatch 'executing' does not match status 'failed'")),
            "{errors:?}"
        );

        let node = graph.node_mut("a").expect("a");
        node.dispatch_mut().expect("record").status = DispatchStatus::Failed;
        assert!(validate_graph(&graph).is_empty());
    }
}
