//! Work brief handed to an external worker when a node is dispatched.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::context::{ContextView, Frame};

const WORK_UNIT_TEMPLATE: &str = include_str!("templates/work_unit.md");

/// Inputs for one rendered brief.
#[derive(Debug, Clone)]
pub struct BriefInputs<'a> {
    pub workspace: &'a str,
    pub view: &'a ContextView,
    pub start_marker: &'a str,
    pub isolation_branch: Option<&'a str>,
    pub verified_by: Option<&'a str>,
}

/// Render the markdown brief for the node at the end of `inputs.view.chain`.
pub fn render_brief(inputs: &BriefInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("work_unit", WORK_UNIT_TEMPLATE)
        .context("load work unit template")?;
    let template = env.get_template("work_unit")?;

    let (node, ancestors): (Option<&Frame>, &[Frame]) = match inputs.view.chain.split_last() {
        Some((node, ancestors)) => (Some(node), ancestors),
        None => (None, &[]),
    };
    let node = node.context("context view has an empty chain")?;

    let rendered = template
        .render(context! {
            workspace => inputs.workspace,
            start_marker => inputs.start_marker,
            isolation_branch => inputs.isolation_branch,
            verified_by => inputs.verified_by,
            node => node,
            chain => ancestors,
            references => &inputs.view.references,
        })
        .context("render work unit template")?;
    Ok(rendered.trim_end().to_string() + "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::{ContextOptions, aggregate};
    use crate::graph::{ExecutionStatus, LogEntry, PlanningStatus};
    use crate::test_support::{execution_node, fixed_now, graph_of, planning_node};

    #[test]
    fn brief_includes_problem_ancestry_and_log() {
        let mut graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            execution_node("auth", Some("root"), ExecutionStatus::Implementing),
        ]);
        let auth = graph.node_mut("auth").expect("auth");
        auth.problem = Some("Login is missing".to_string());
        graph.node_mut("root").expect("root").log.push(LogEntry {
            at: fixed_now(),
            message: "picked JWT".to_string(),
        });

        let view = aggregate(&graph, "auth", &ContextOptions::default()).expect("context");
        let brief = render_brief(&BriefInputs {
            workspace: "default",
            view: &view,
            start_marker: "abc123",
            isolation_branch: Some("tasktree/dispatch/default"),
            verified_by: None,
        })
        .expect("render");

        assert!(brief.starts_with("# Work unit: auth title"));
        assert!(brief.contains("Login is missing"));
        assert!(brief.contains("`root`"));
        assert!(brief.contains("picked JWT"));
        assert!(brief.contains("tasktree/dispatch/default"));
        assert!(!brief.contains("Verified by"));
    }
}
