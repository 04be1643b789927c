//! Helpers for rendering deterministic node paths.

use crate::graph::Graph;

/// Return the `/`-separated id path from the root to `target_id`.
pub fn node_path(graph: &Graph, target_id: &str) -> Option<String> {
    let target = graph.node(target_id)?;
    let mut ids: Vec<&str> = graph
        .ancestors(target_id)
        .iter()
        .map(|node| node.id.as_str())
        .collect();
    ids.reverse();
    ids.push(target.id.as_str());
    Some(ids.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ExecutionStatus, PlanningStatus};
    use crate::test_support::{execution_node, graph_of, planning_node};

    #[test]
    fn node_path_returns_root_for_root_id() {
        let graph = graph_of(vec![planning_node("root", None, PlanningStatus::Pending)]);
        assert_eq!(node_path(&graph, "root"), Some("root".to_string()));
    }

    #[test]
    fn node_path_joins_ancestry() {
        let graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            planning_node("api", Some("root"), PlanningStatus::Monitoring),
            execution_node("auth", Some("api"), ExecutionStatus::Pending),
        ]);
        assert_eq!(node_path(&graph, "auth"), Some("root/api/auth".to_string()));
        assert_eq!(node_path(&graph, "missing"), None);
    }
}
