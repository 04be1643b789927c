//! Validation of a project's `.tasktree/` layout, config, graphs and dispatch
//! session.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

use crate::core::ids::validate_id;
use crate::io::config::load_config;
use crate::io::layout::{ProjectPaths, TASKTREE_GITIGNORE};
use crate::io::store::{FileStore, GraphStore};

/// Active dispatch found while validating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveDispatch {
    pub workspace: String,
    pub node_id: String,
}

/// High-level validation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidateOutcome {
    /// Workspaces whose graphs loaded cleanly, sorted.
    pub workspaces: Vec<String>,
    /// Workspace holding the dispatch session, if any.
    pub dispatch_enabled: Option<String>,
    pub active_dispatch: Option<ActiveDispatch>,
}

/// Validate `.tasktree/` layout, config, every workspace graph, and the
/// single-active-dispatch rule across the project.
pub fn validate_project(root: &Path) -> Result<ValidateOutcome> {
    let paths = ProjectPaths::new(root);

    ensure_dir(&paths.tasktree_dir)?;
    ensure_dir(&paths.state_dir)?;
    ensure_dir(&paths.workspaces_dir)?;
    ensure_file(&paths.config_path)?;
    ensure_gitignore(&paths.gitignore_path)?;

    load_config(&paths.config_path).with_context(|| "load config.toml")?;

    let store = FileStore::new(paths.clone());
    let workspaces = store.list_workspaces()?;
    let mut active: Vec<ActiveDispatch> = Vec::new();
    for workspace in &workspaces {
        validate_id(workspace).map_err(|err| anyhow!("workspace directory: {err}"))?;
        let graph = store
            .read_graph(workspace)
            .with_context(|| format!("load workspace '{workspace}'"))?;
        active.extend(
            graph
                .nodes
                .values()
                .filter(|node| node.has_active_dispatch())
                .map(|node| ActiveDispatch {
                    workspace: workspace.clone(),
                    node_id: node.id.clone(),
                }),
        );
    }
    if active.len() > 1 {
        let holders: Vec<String> = active
            .iter()
            .map(|a| format!("{}/{}", a.workspace, a.node_id))
            .collect();
        return Err(anyhow!(
            "more than one active dispatch: {}",
            holders.join(", ")
        ));
    }
    let active = active.pop();

    let session = store
        .read_session()
        .with_context(|| "load dispatch session")?;
    if let Some(active) = &active {
        match &session {
            Some(session) if session.workspace == active.workspace => {}
            Some(session) => {
                return Err(anyhow!(
                    "dispatch session belongs to '{}' but '{}/{}' is active",
                    session.workspace,
                    active.workspace,
                    active.node_id
                ));
            }
            None => {
                return Err(anyhow!(
                    "'{}/{}' has an active dispatch but dispatch is not enabled",
                    active.workspace,
                    active.node_id
                ));
            }
        }
    }
    if let Some(session) = &session {
        validate_id(&session.workspace).map_err(|err| anyhow!("dispatch session: {err}"))?;
        if session.use_version_control
            && (session.base_branch.is_none() || session.isolation_branch.is_none())
        {
            return Err(anyhow!(
                "dispatch session for '{}' uses version control but has no branches",
                session.workspace
            ));
        }
    }

    Ok(ValidateOutcome {
        workspaces,
        dispatch_enabled: session.map(|session| session.workspace),
        active_dispatch: active,
    })
}

fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("missing directory {}", path.display()));
    }
    if !path.is_dir() {
        return Err(anyhow!("expected directory {}", path.display()));
    }
    Ok(())
}

fn ensure_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(anyhow!("missing file {}", path.display()));
    }
    if !path.is_file() {
        return Err(anyhow!("expected file {}", path.display()));
    }
    Ok(())
}

fn ensure_gitignore(path: &Path) -> Result<()> {
    ensure_file(path)?;
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let required = TASKTREE_GITIGNORE.trim();
    if !contents.lines().any(|line| line.trim() == required) {
        return Err(anyhow!("missing '{}' in {}", required, path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatch::{DispatchEvent, advance, new_record};
    use crate::graph::{DispatchSession, ExecutionStatus, Graph, PlanningStatus};
    use crate::io::layout::{InitOptions, init_project};
    use crate::test_support::{execution_node, fixed_now, graph_of, planning_node};

    fn dispatched_graph() -> Graph {
        let mut graph = graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            execution_node("task", Some("root"), ExecutionStatus::Implementing),
        ]);
        let mut record = new_record(false, "t0".to_string(), fixed_now());
        advance("task", &mut record, DispatchEvent::Begin, fixed_now()).expect("begin");
        graph
            .node_mut("task")
            .expect("task")
            .set_dispatch(record)
            .expect("record");
        graph
    }

    fn session(workspace: &str) -> DispatchSession {
        DispatchSession {
            workspace: workspace.to_string(),
            use_version_control: false,
            base_branch: None,
            isolation_branch: None,
            enabled_at: fixed_now(),
        }
    }

    #[test]
    fn validate_ok_on_fresh_project() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_project(temp.path(), &InitOptions { force: false }).expect("init");

        let outcome = validate_project(temp.path()).expect("validate");
        assert!(outcome.workspaces.is_empty());
        assert_eq!(outcome.dispatch_enabled, None);
        assert_eq!(outcome.active_dispatch, None);
    }

    #[test]
    fn validate_reports_active_dispatch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");
        let store = FileStore::new(paths);
        store.write_graph("w1", &dispatched_graph()).expect("write");
        store.write_session(Some(&session("w1"))).expect("session");

        let outcome = validate_project(temp.path()).expect("validate");
        assert_eq!(outcome.workspaces, vec!["w1"]);
        assert_eq!(outcome.dispatch_enabled.as_deref(), Some("w1"));
        assert_eq!(
            outcome.active_dispatch,
            Some(ActiveDispatch {
                workspace: "w1".to_string(),
                node_id: "task".to_string(),
            })
        );
    }

    #[test]
    fn validate_errors_on_two_active_dispatches() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");
        let store = FileStore::new(paths);
        store.write_graph("w1", &dispatched_graph()).expect("write");
        store.write_graph("w2", &dispatched_graph()).expect("write");

        let err = validate_project(temp.path()).expect_err("validate should fail");
        assert!(err.to_string().contains("more than one active dispatch"));
    }

    #[test]
    fn validate_errors_on_session_mismatch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");
        let store = FileStore::new(paths);
        store.write_graph("w1", &dispatched_graph()).expect("write");
        store.write_session(Some(&session("w2"))).expect("session");

        let err = validate_project(temp.path()).expect_err("validate should fail");
        assert!(err.to_string().contains("dispatch session belongs to 'w2'"));
    }

    #[test]
    fn validate_errors_on_missing_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = validate_project(temp.path()).expect_err("validate should fail");
        assert!(err.to_string().contains("missing directory"));
    }
}
