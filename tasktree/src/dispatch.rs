//! Dispatch engine: delegate one execution node at a time to an isolated
//! worker, then commit, verify, roll back or merge its changes.
//!
//! Every operation holds the project dispatch lock for its whole duration and
//! takes the workspace lock inside it. The stored [`DispatchSession`] is the
//! project's "dispatch enabled" flag and the primary single-dispatch guard;
//! scanning every workspace for an active record is only a fallback for state
//! left behind by an interrupted process.
//!
//! State-machine checks run before any VCS side effect, and a failing VCS
//! call returns before anything is written, so graph and session stay as they
//! were.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::context::aggregate;
use crate::core::dispatch::{
    DispatchEvent, advance, commit_message, isolation_branch, merge_message, new_record,
};
use crate::core::state_machine::{apply_transition, plan_transition};
use crate::core::types::{Action, MergeStrategy, TransitionOutcome};
use crate::error::{Error, Result};
use crate::graph::{DispatchSession, DispatchStatus, ExecutionStatus, Graph, Status};
use crate::io::brief::{BriefInputs, render_brief};
use crate::io::store::GraphStore;
use crate::io::vcs::{VcsAdapter, VcsError};
use crate::service::Orchestrator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnableOutcome {
    pub enabled: bool,
    /// True when this workspace already held the session.
    pub already_enabled: bool,
    pub session: DispatchSession,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrepareOutcome {
    pub node_id: String,
    pub start_marker: String,
    pub dispatch_status: DispatchStatus,
    /// True when the node was already executing and nothing changed.
    pub already_prepared: bool,
    pub brief: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompleteOutcome {
    pub node_id: String,
    pub end_marker: Option<String>,
    /// Files the dispatch changed (version-controlled success only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed_files: Vec<String>,
    pub next_status: Status,
    pub dispatch_status: DispatchStatus,
    pub transition: TransitionOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisableOptions {
    /// Override `dispatch.delete_branch_after_merge`.
    pub delete_branch: Option<bool>,
    /// Commit message for strategies that create a merge commit.
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisableOutcome {
    pub workspace: String,
    pub strategy: MergeStrategy,
    pub merged: bool,
    pub commit: Option<String>,
    pub branch_deleted: bool,
}

impl<S: GraphStore, V: VcsAdapter> Orchestrator<S, V> {
    /// Turn dispatch mode on for `workspace`.
    ///
    /// Idempotent for the workspace that already holds the session; any other
    /// holder (session or active record) is a concurrency conflict.
    #[instrument(skip_all, fields(workspace, use_version_control))]
    pub fn dispatch_enable(&self, workspace: &str, use_version_control: bool) -> Result<EnableOutcome> {
        crate::core::ids::validate_id(workspace)?;
        let _dispatch = self.dispatch_guard()?;

        if let Some(session) = self.store.read_session()? {
            if session.workspace != workspace {
                let holder = self.store.read_graph(&session.workspace)?;
                return Err(Error::DispatchConcurrencyConflict {
                    node_id: holder.active_dispatch().map(|node| node.id.clone()),
                    workspace: session.workspace,
                });
            }
            info!(workspace, "dispatch already enabled");
            return Ok(EnableOutcome {
                enabled: true,
                already_enabled: true,
                session,
            });
        }

        for other in self.store.list_workspaces()? {
            let graph = self.store.read_graph(&other)?;
            if let Some(node) = graph.active_dispatch() {
                warn!(workspace = %other, node_id = %node.id, "active dispatch record without a session");
                return Err(Error::DispatchConcurrencyConflict {
                    workspace: other.clone(),
                    node_id: Some(node.id.clone()),
                });
            }
        }

        let prefix = &self.config.dispatch.branch_prefix;
        let (base_branch, isolation) = if use_version_control {
            if !self.vcs.is_repository() {
                return Err(Error::VcsOperationFailed {
                    operation: "enable".to_string(),
                    message: "working directory is not a git repository".to_string(),
                });
            }
            let current = self.vcs.current_branch().map_err(vcs_failed("enable"))?;
            let isolation = isolation_branch(prefix, workspace);
            if current == isolation {
                return Err(Error::VcsOperationFailed {
                    operation: "enable".to_string(),
                    message: format!("'{current}' is the isolation branch; check out the base branch first"),
                });
            }
            if let Some(holder) = current.strip_prefix(&format!("{prefix}/")) {
                return Err(Error::DispatchConcurrencyConflict {
                    workspace: holder.to_string(),
                    node_id: None,
                });
            }
            (Some(current), Some(isolation))
        } else {
            (None, None)
        };

        let session = DispatchSession {
            workspace: workspace.to_string(),
            use_version_control,
            base_branch,
            isolation_branch: isolation,
            enabled_at: self.now(),
        };
        self.store.write_session(Some(&session))?;
        info!(workspace, "dispatch enabled");
        Ok(EnableOutcome {
            enabled: true,
            already_enabled: false,
            session,
        })
    }

    /// Record the start marker for an implementing execution node and render
    /// its work brief. Re-preparing an executing node returns its marker.
    #[instrument(skip_all, fields(workspace, node_id))]
    pub fn dispatch_prepare(&self, workspace: &str, node_id: &str) -> Result<PrepareOutcome> {
        let _dispatch = self.dispatch_guard()?;
        let session = self.enabled_session(workspace)?;

        self.locked(workspace, || {
            let mut graph = self.store.read_graph(workspace)?;
            let node = graph.require(node_id)?;
            if let Some(record) = node.dispatch().filter(|r| r.status == DispatchStatus::Executing) {
                let start_marker = record.start_marker.clone();
                let brief = self.brief(workspace, &graph, node_id, &start_marker, &session)?;
                return Ok(PrepareOutcome {
                    node_id: node_id.to_string(),
                    start_marker,
                    dispatch_status: DispatchStatus::Executing,
                    already_prepared: true,
                    brief,
                });
            }
            if node.status() != Status::Execution(ExecutionStatus::Implementing) {
                return Err(Error::invalid_transition(node_id, node.status(), "dispatch"));
            }
            if let Some(other) = graph.active_dispatch() {
                return Err(Error::DispatchConcurrencyConflict {
                    workspace: workspace.to_string(),
                    node_id: Some(other.id.clone()),
                });
            }

            let now = self.now();
            let start_marker = if session.use_version_control {
                self.enter_isolation(&session)?
            } else {
                now.to_rfc3339()
            };

            let mut record = new_record(session.use_version_control, start_marker.clone(), now);
            let status = advance(node_id, &mut record, DispatchEvent::Begin, now)?;
            let node = graph.require_mut(node_id)?;
            node.set_dispatch(record)?;
            node.updated_at = now;
            self.store.write_graph(workspace, &graph)?;
            info!(workspace, node_id, start_marker = %start_marker, "dispatch prepared");

            let brief = self.brief(workspace, &graph, node_id, &start_marker, &session)?;
            Ok(PrepareOutcome {
                node_id: node_id.to_string(),
                start_marker,
                dispatch_status: status,
                already_prepared: false,
                brief,
            })
        })
    }

    /// Finish an executing dispatch.
    ///
    /// Success commits the work (VCS mode) and either completes the node or,
    /// when it has a verifier, submits it for testing. Failure rolls the
    /// working tree back to the start marker and fails the node.
    #[instrument(skip_all, fields(workspace, node_id, success))]
    pub fn dispatch_complete(
        &self,
        workspace: &str,
        node_id: &str,
        success: bool,
        conclusion: Option<&str>,
    ) -> Result<CompleteOutcome> {
        let _dispatch = self.dispatch_guard()?;
        let session = self.enabled_session(workspace)?;

        self.locked(workspace, || {
            let mut graph = self.store.read_graph(workspace)?;
            let node = graph.require(node_id)?;
            let record = node
                .dispatch()
                .filter(|r| r.status == DispatchStatus::Executing)
                .ok_or_else(|| Error::DispatchNotPrepared {
                    node_id: node_id.to_string(),
                    expected: DispatchStatus::Executing,
                })?
                .clone();
            let verified = node.verified_by.is_some();
            let (action, event) = match (success, verified) {
                (true, true) => (Action::Submit, DispatchEvent::Submit),
                (true, false) => (Action::Complete, DispatchEvent::Pass),
                (false, _) => (Action::Fail, DispatchEvent::Fail),
            };
            let conclusion = required_conclusion(node_id, conclusion, action)?;
            let plan = plan_transition(&graph, node_id, action, Some(&conclusion))?;

            let now = self.now();
            if record.use_version_control {
                self.ensure_on_isolation(&session, if success { "commit" } else { "rollback" })?;
            }
            let mut changed_files = Vec::new();
            let end_marker = match (success, record.use_version_control) {
                (true, true) => {
                    let message =
                        commit_message(&self.config.dispatch.commit_prefix, node, &conclusion);
                    let head = self.vcs.commit(&message).map_err(vcs_failed("commit"))?;
                    changed_files = self
                        .vcs
                        .changed_files(&record.start_marker, &head)
                        .unwrap_or_else(|err| {
                            warn!(node_id, error = %err, "could not list changed files");
                            Vec::new()
                        });
                    Some(head)
                }
                (true, false) => Some(now.to_rfc3339()),
                (false, true) => {
                    self.rollback(&record.start_marker)?;
                    None
                }
                (false, false) => None,
            };

            let mut outcome =
                self.finish(&mut graph, &plan, event, end_marker, Some(conclusion), now)?;
            outcome.changed_files = changed_files;
            self.store.write_graph(workspace, &graph)?;
            info!(
                workspace,
                node_id,
                dispatch_status = %outcome.dispatch_status,
                status = %outcome.next_status,
                "dispatch completed"
            );
            Ok(outcome)
        })
    }

    /// Record the paired verifier's verdict for a node in `testing`.
    ///
    /// A pass completes the node with the given conclusion or the one parked
    /// by `dispatch_complete`; a failure rolls back and fails the node.
    #[instrument(skip_all, fields(workspace, node_id, passed))]
    pub fn dispatch_verify(
        &self,
        workspace: &str,
        node_id: &str,
        passed: bool,
        conclusion: Option<&str>,
    ) -> Result<CompleteOutcome> {
        let _dispatch = self.dispatch_guard()?;
        let session = self.enabled_session(workspace)?;

        self.locked(workspace, || {
            let mut graph = self.store.read_graph(workspace)?;
            let node = graph.require(node_id)?;
            let record = node
                .dispatch()
                .filter(|r| r.status == DispatchStatus::Testing)
                .ok_or_else(|| Error::DispatchNotPrepared {
                    node_id: node_id.to_string(),
                    expected: DispatchStatus::Testing,
                })?
                .clone();
            let (action, event) = if passed {
                (Action::Complete, DispatchEvent::Pass)
            } else {
                (Action::Fail, DispatchEvent::Fail)
            };
            let given = conclusion.or(if passed {
                record.pending_conclusion.as_deref()
            } else {
                None
            });
            let conclusion = required_conclusion(node_id, given, action)?;
            let plan = plan_transition(&graph, node_id, action, Some(&conclusion))?;

            if !passed && session.use_version_control {
                self.ensure_on_isolation(&session, "rollback")?;
                self.rollback(&record.start_marker)?;
            }

            let now = self.now();
            let outcome =
                self.finish(&mut graph, &plan, event, record.end_marker.clone(), Some(conclusion), now)?;
            self.store.write_graph(workspace, &graph)?;
            info!(workspace, node_id, passed, "dispatch verified");
            Ok(outcome)
        })
    }

    /// Turn dispatch mode off, folding the isolation branch into the base
    /// branch with `strategy` (or the configured default).
    ///
    /// Conflicts are aborted and reported; the session then stays enabled.
    #[instrument(skip_all, fields(workspace))]
    pub fn dispatch_disable(
        &self,
        workspace: &str,
        strategy: Option<MergeStrategy>,
        options: &DisableOptions,
    ) -> Result<DisableOutcome> {
        let _dispatch = self.dispatch_guard()?;
        let session = self.enabled_session(workspace)?;
        let strategy = strategy.unwrap_or(self.config.dispatch.default_merge_strategy);

        self.locked(workspace, || {
            let graph = self.store.read_graph(workspace)?;
            if let Some(node) = graph.active_dispatch() {
                return Err(Error::DispatchConcurrencyConflict {
                    workspace: workspace.to_string(),
                    node_id: Some(node.id.clone()),
                });
            }

            let mut outcome = DisableOutcome {
                workspace: workspace.to_string(),
                strategy,
                merged: false,
                commit: None,
                branch_deleted: false,
            };
            if let (true, Some(base), Some(isolation)) = (
                session.use_version_control,
                session.base_branch.as_deref(),
                session.isolation_branch.as_deref(),
            ) {
                let message = options.message.clone().unwrap_or_else(|| {
                    merge_message(&self.config.dispatch.commit_prefix, workspace)
                });
                self.merge_isolation(strategy, isolation, base, &message, &mut outcome)?;
                let delete = options
                    .delete_branch
                    .unwrap_or(self.config.dispatch.delete_branch_after_merge);
                if delete
                    && matches!(strategy, MergeStrategy::Sequential | MergeStrategy::Squash)
                    && self.vcs.branch_exists(isolation).map_err(vcs_failed("disable"))?
                {
                    self.vcs
                        .delete_branch(isolation)
                        .map_err(vcs_failed("delete branch"))?;
                    outcome.branch_deleted = true;
                }
            }

            self.store.write_session(None)?;
            info!(workspace, %strategy, merged = outcome.merged, "dispatch disabled");
            Ok(outcome)
        })
    }

    fn enabled_session(&self, workspace: &str) -> Result<DispatchSession> {
        crate::core::ids::validate_id(workspace)?;
        match self.store.read_session()? {
            Some(session) if session.workspace == workspace => Ok(session),
            _ => Err(Error::DispatchNotEnabled {
                workspace: workspace.to_string(),
            }),
        }
    }

    /// Switch to the isolation branch on a clean tree; returns HEAD.
    fn enter_isolation(&self, session: &DispatchSession) -> Result<String> {
        let isolation = session
            .isolation_branch
            .as_deref()
            .ok_or_else(|| Error::VcsOperationFailed {
                operation: "prepare".to_string(),
                message: "session has no isolation branch".to_string(),
            })?;
        if self
            .vcs
            .has_uncommitted_changes()
            .map_err(vcs_failed("prepare"))?
        {
            return Err(Error::VcsOperationFailed {
                operation: "prepare".to_string(),
                message: "working tree has uncommitted changes".to_string(),
            });
        }
        self.vcs
            .create_isolation_branch(isolation)
            .map_err(vcs_failed("prepare"))?;
        self.vcs.head().map_err(vcs_failed("prepare"))
    }

    /// Commits and resets only ever touch the isolation branch.
    fn ensure_on_isolation(&self, session: &DispatchSession, operation: &'static str) -> Result<()> {
        let isolation = session
            .isolation_branch
            .as_deref()
            .ok_or_else(|| Error::VcsOperationFailed {
                operation: operation.to_string(),
                message: "session has no isolation branch".to_string(),
            })?;
        let current = self.vcs.current_branch().map_err(vcs_failed(operation))?;
        if current != isolation {
            return Err(Error::VcsOperationFailed {
                operation: operation.to_string(),
                message: format!("expected isolation branch '{isolation}' but '{current}' is checked out"),
            });
        }
        Ok(())
    }

    fn rollback(&self, start_marker: &str) -> Result<()> {
        warn!(start_marker, "rolling back dispatch changes");
        self.vcs
            .hard_reset(start_marker)
            .map_err(vcs_failed("rollback"))
    }

    fn merge_isolation(
        &self,
        strategy: MergeStrategy,
        isolation: &str,
        base: &str,
        message: &str,
        outcome: &mut DisableOutcome,
    ) -> Result<()> {
        if strategy != MergeStrategy::Skip
            && self
                .vcs
                .has_uncommitted_changes()
                .map_err(vcs_failed("disable"))?
        {
            return Err(Error::VcsOperationFailed {
                operation: "disable".to_string(),
                message: "working tree has uncommitted changes".to_string(),
            });
        }
        if !self.vcs.branch_exists(isolation).map_err(vcs_failed("disable"))? {
            self.vcs.checkout(base).map_err(vcs_failed("disable"))?;
            return Ok(());
        }
        let merged = self
            .vcs
            .merge(strategy, isolation, base, message)
            .map_err(|err| match err {
                VcsError::Conflict { files, .. } => Error::MergeConflict { strategy, files },
                other => vcs_failed("merge")(other),
            })?;
        outcome.merged = merged.merged;
        outcome.commit = merged.commit;
        Ok(())
    }

    /// Apply the planned transition and dispatch event to `graph`.
    fn finish(
        &self,
        graph: &mut Graph,
        plan: &TransitionOutcome,
        event: DispatchEvent,
        end_marker: Option<String>,
        conclusion: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome> {
        let node = graph.require_mut(&plan.node_id)?;
        let Some(record) = node.dispatch_mut() else {
            return Err(Error::DispatchNotPrepared {
                node_id: plan.node_id.clone(),
                expected: event.expected_from(),
            });
        };
        let dispatch_status = advance(&plan.node_id, record, event, now)?;
        record.end_marker = end_marker.clone();
        record.pending_conclusion = if event == DispatchEvent::Submit {
            conclusion
        } else {
            None
        };
        apply_transition(graph, plan, now)?;
        Ok(CompleteOutcome {
            node_id: plan.node_id.clone(),
            end_marker,
            changed_files: Vec::new(),
            next_status: plan.current_status,
            dispatch_status,
            transition: plan.clone(),
        })
    }

    fn brief(
        &self,
        workspace: &str,
        graph: &Graph,
        node_id: &str,
        start_marker: &str,
        session: &DispatchSession,
    ) -> Result<String> {
        let view = aggregate(graph, node_id, &self.default_context_options())?;
        let verified_by = graph.require(node_id)?.verified_by.as_deref();
        Ok(render_brief(&BriefInputs {
            workspace,
            view: &view,
            start_marker,
            isolation_branch: session.isolation_branch.as_deref(),
            verified_by,
        })?)
    }
}

/// Blank conclusions count as missing.
fn required_conclusion(node_id: &str, conclusion: Option<&str>, action: Action) -> Result<String> {
    conclusion
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::ConclusionRequired {
            node_id: node_id.to_string(),
            action: action.as_str().to_string(),
        })
}

fn vcs_failed(operation: &'static str) -> impl Fn(VcsError) -> Error {
    move |err| Error::VcsOperationFailed {
        operation: operation.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::creation::NewNode;
    use crate::graph::{NodeKind, PlanningStatus};
    use crate::io::config::ProjectConfig;
    use crate::io::store::MemoryStore;
    use crate::test_support::FakeVcs;

    type TestOrchestrator = Orchestrator<MemoryStore, FakeVcs>;

    fn orchestrator() -> TestOrchestrator {
        Orchestrator::new(MemoryStore::new(), FakeVcs::new(), ProjectConfig::default())
    }

    /// root (planning) -> task (execution, implementing)
    fn seed(orch: &TestOrchestrator, workspace: &str) {
        orch.create_node(workspace, NewNode::new("root", NodeKind::Planning, None, "Root"))
            .expect("root");
        orch.create_node(
            workspace,
            NewNode::new("task", NodeKind::Execution, Some("root"), "Task"),
        )
        .expect("task");
        orch.transition(workspace, "task", Action::Start, None)
            .expect("start");
    }

    fn dispatch_status(orch: &TestOrchestrator, workspace: &str, node_id: &str) -> Option<DispatchStatus> {
        orch.graph(workspace)
            .expect("graph")
            .node(node_id)
            .and_then(|node| node.dispatch().map(|record| record.status))
    }

    #[test]
    fn enable_records_base_and_isolation_branch() {
        let orch = orchestrator();
        let outcome = orch.dispatch_enable("w1", true).expect("enable");
        assert_eq!(outcome.session.base_branch.as_deref(), Some("main"));
        assert_eq!(
            outcome.session.isolation_branch.as_deref(),
            Some("tasktree/dispatch/w1")
        );

        let again = orch.dispatch_enable("w1", true).expect("idempotent");
        assert!(again.already_enabled);
        assert_eq!(again.session, outcome.session);
    }

    #[test]
    fn enable_without_repository_fails_cleanly() {
        let orch = Orchestrator::new(
            MemoryStore::new(),
            FakeVcs::without_repository(),
            ProjectConfig::default(),
        );
        let err = orch.dispatch_enable("w1", true).expect_err("no repo");
        assert_eq!(err.code(), "vcs_operation_failed");
        assert_eq!(orch.store().read_session().expect("session"), None);

        orch.dispatch_enable("w1", false).expect("plain mode works");
    }

    #[test]
    fn second_workspace_conflicts_and_names_holder() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", false).expect("enable");
        orch.dispatch_prepare("w1", "task").expect("prepare");

        let err = orch.dispatch_enable("w2", false).expect_err("conflict");
        match err {
            Error::DispatchConcurrencyConflict { workspace, node_id } => {
                assert_eq!(workspace, "w1");
                assert_eq!(node_id.as_deref(), Some("task"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// The node scan catches a stale record even without a session.
    #[test]
    fn stale_active_record_blocks_enable() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", false).expect("enable");
        orch.dispatch_prepare("w1", "task").expect("prepare");
        orch.store().write_session(None).expect("drop session");

        let err = orch.dispatch_enable("w2", false).expect_err("conflict");
        assert_eq!(err.code(), "dispatch_concurrency_conflict");
    }

    #[test]
    fn prepare_requires_enabled_session_and_implementing_node() {
        let orch = orchestrator();
        seed(&orch, "w1");
        let err = orch.dispatch_prepare("w1", "task").expect_err("not enabled");
        assert_eq!(err.code(), "dispatch_not_enabled");

        orch.dispatch_enable("w1", false).expect("enable");
        let err = orch.dispatch_prepare("w1", "root").expect_err("planning node");
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn prepare_is_idempotent_for_executing_node() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", true).expect("enable");
        let first = orch.dispatch_prepare("w1", "task").expect("prepare");
        let second = orch.dispatch_prepare("w1", "task").expect("again");
        assert_eq!(first.start_marker, "c1");
        assert_eq!(second.start_marker, first.start_marker);
        assert!(second.already_prepared);
        assert_eq!(
            orch.vcs().calls(),
            vec!["isolate tasktree/dispatch/w1".to_string()]
        );
        assert!(first.brief.contains("Task"));
    }

    #[test]
    fn prepare_refuses_dirty_tree_without_side_effects() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", true).expect("enable");
        orch.vcs().set_dirty(true);
        let err = orch.dispatch_prepare("w1", "task").expect_err("dirty");
        assert_eq!(err.code(), "vcs_operation_failed");
        assert_eq!(dispatch_status(&orch, "w1", "task"), None);
        assert!(orch.vcs().calls().is_empty());
    }

    #[test]
    fn successful_completion_commits_and_completes() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", true).expect("enable");
        orch.dispatch_prepare("w1", "task").expect("prepare");

        let outcome = orch
            .dispatch_complete("w1", "task", true, Some("implemented"))
            .expect("complete");
        assert_eq!(outcome.end_marker.as_deref(), Some("c2"));
        assert_eq!(outcome.dispatch_status, DispatchStatus::Passed);
        assert_eq!(
            outcome.next_status,
            Status::Execution(ExecutionStatus::Completed)
        );
        assert!(orch.vcs().calls().contains(&"commit tasktree(task): Task".to_string()));
    }

    #[test]
    fn failed_completion_rolls_back_to_start_marker() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", true).expect("enable");
        let prepared = orch.dispatch_prepare("w1", "task").expect("prepare");

        let outcome = orch
            .dispatch_complete("w1", "task", false, Some("tests broke"))
            .expect("fail");
        assert_eq!(outcome.end_marker, None);
        assert_eq!(outcome.dispatch_status, DispatchStatus::Failed);
        assert_eq!(outcome.next_status, Status::Execution(ExecutionStatus::Failed));
        assert!(
            orch.vcs()
                .calls()
                .contains(&format!("reset {}", prepared.start_marker))
        );
    }

    /// A failing VCS call leaves graph and session exactly as they were.
    #[test]
    fn vcs_failure_during_completion_changes_nothing() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", true).expect("enable");
        orch.dispatch_prepare("w1", "task").expect("prepare");
        let before = orch.graph("w1").expect("graph");

        orch.vcs().fail_on("commit");
        let err = orch
            .dispatch_complete("w1", "task", true, Some("done"))
            .expect_err("commit fails");
        assert_eq!(err.code(), "vcs_operation_failed");
        assert_eq!(orch.graph("w1").expect("graph"), before);
    }

    #[test]
    fn completion_requires_executing_record_and_conclusion() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", false).expect("enable");
        let err = orch
            .dispatch_complete("w1", "task", true, Some("done"))
            .expect_err("not prepared");
        assert_eq!(err.code(), "dispatch_not_prepared");

        orch.dispatch_prepare("w1", "task").expect("prepare");
        let err = orch
            .dispatch_complete("w1", "task", true, Some(" "))
            .expect_err("blank");
        assert_eq!(err.code(), "conclusion_required");
        assert_eq!(
            dispatch_status(&orch, "w1", "task"),
            Some(DispatchStatus::Executing)
        );
    }

    /// Commit and rollback refuse to run on any branch but the isolation branch.
    #[test]
    fn completion_off_isolation_branch_touches_nothing() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", true).expect("enable");
        orch.dispatch_prepare("w1", "task").expect("prepare");
        orch.vcs().checkout("main").expect("leave isolation");

        for success in [false, true] {
            let err = orch
                .dispatch_complete("w1", "task", success, Some("done"))
                .expect_err("wrong branch");
            assert_eq!(err.code(), "vcs_operation_failed");
            assert!(err.to_string().contains("'main' is checked out"), "{err}");
        }
        assert_eq!(
            orch.vcs().calls(),
            vec![
                "isolate tasktree/dispatch/w1".to_string(),
                "checkout main".to_string(),
            ]
        );
        assert_eq!(
            dispatch_status(&orch, "w1", "task"),
            Some(DispatchStatus::Executing)
        );

        orch.vcs()
            .checkout("tasktree/dispatch/w1")
            .expect("back to isolation");
        let outcome = orch
            .dispatch_complete("w1", "task", false, Some("gave up"))
            .expect("fail on isolation branch");
        assert_eq!(outcome.dispatch_status, DispatchStatus::Failed);
    }

    /// Once the commit exists, a failing diff only costs the file list.
    #[test]
    fn changed_files_failure_keeps_the_commit() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", true).expect("enable");
        orch.dispatch_prepare("w1", "task").expect("prepare");
        orch.vcs().fail_on("changed_files");

        let outcome = orch
            .dispatch_complete("w1", "task", true, Some("implemented"))
            .expect("complete");
        assert_eq!(outcome.end_marker.as_deref(), Some("c2"));
        assert!(outcome.changed_files.is_empty());
        assert_eq!(
            dispatch_status(&orch, "w1", "task"),
            Some(DispatchStatus::Passed)
        );
    }

    /// With a verifier, completion parks the conclusion until the verdict.
    #[test]
    fn verifier_routes_completion_through_testing() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.create_node(
            "w1",
            NewNode::new("check", NodeKind::Execution, Some("root"), "Check"),
        )
        .expect("verifier");
        let mut work = NewNode::new("work", NodeKind::Execution, Some("root"), "Work");
        work.verified_by = Some("check".to_string());
        orch.create_node("w1", work).expect("work");
        orch.transition("w1", "work", Action::Start, None).expect("start");

        orch.dispatch_enable("w1", false).expect("enable");
        orch.dispatch_prepare("w1", "work").expect("prepare");
        let submitted = orch
            .dispatch_complete("w1", "work", true, Some("ready for review"))
            .expect("submit");
        assert_eq!(submitted.dispatch_status, DispatchStatus::Testing);
        assert_eq!(
            submitted.next_status,
            Status::Execution(ExecutionStatus::Validating)
        );

        let err = orch
            .dispatch_disable("w1", None, &DisableOptions::default())
            .expect_err("testing is active");
        assert_eq!(err.code(), "dispatch_concurrency_conflict");

        let verified = orch
            .dispatch_verify("w1", "work", true, None)
            .expect("verify");
        assert_eq!(verified.dispatch_status, DispatchStatus::Passed);
        let graph = orch.graph("w1").expect("graph");
        let node = graph.node("work").expect("work");
        assert_eq!(node.conclusion.as_deref(), Some("ready for review"));
        assert_eq!(node.dispatch().and_then(|r| r.pending_conclusion.clone()), None);
    }

    #[test]
    fn failed_verification_rolls_back() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.create_node(
            "w1",
            NewNode::new("check", NodeKind::Execution, Some("root"), "Check"),
        )
        .expect("verifier");
        let mut graph = orch.graph("w1").expect("graph");
        graph.node_mut("task").expect("task").verified_by = Some("check".to_string());
        orch.store().write_graph("w1", &graph).expect("write");

        orch.dispatch_enable("w1", true).expect("enable");
        let prepared = orch.dispatch_prepare("w1", "task").expect("prepare");
        orch.dispatch_complete("w1", "task", true, Some("ready"))
            .expect("submit");

        let err = orch
            .dispatch_verify("w1", "task", false, None)
            .expect_err("failure needs a conclusion");
        assert_eq!(err.code(), "conclusion_required");

        let outcome = orch
            .dispatch_verify("w1", "task", false, Some("regression in login"))
            .expect("fail");
        assert_eq!(outcome.next_status, Status::Execution(ExecutionStatus::Failed));
        assert!(
            orch.vcs()
                .calls()
                .contains(&format!("reset {}", prepared.start_marker))
        );
    }

    #[test]
    fn disable_merges_and_clears_session() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", true).expect("enable");
        orch.dispatch_prepare("w1", "task").expect("prepare");
        orch.dispatch_complete("w1", "task", true, Some("done"))
            .expect("complete");

        let outcome = orch
            .dispatch_disable(
                "w1",
                Some(MergeStrategy::Squash),
                &DisableOptions {
                    delete_branch: Some(true),
                    message: None,
                },
            )
            .expect("disable");
        assert!(outcome.merged);
        assert!(outcome.branch_deleted);
        assert_eq!(orch.store().read_session().expect("session"), None);
        assert_eq!(orch.vcs().current(), "main");

        orch.dispatch_enable("w2", false).expect("another workspace may enable");
    }

    #[test]
    fn merge_conflict_keeps_session_enabled() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", true).expect("enable");
        orch.dispatch_prepare("w1", "task").expect("prepare");
        orch.dispatch_complete("w1", "task", true, Some("done"))
            .expect("complete");

        orch.vcs().conflict_on_merge(&["src/lib.rs"]);
        let err = orch
            .dispatch_disable("w1", None, &DisableOptions::default())
            .expect_err("conflict");
        match &err {
            Error::MergeConflict { strategy, files } => {
                assert_eq!(*strategy, MergeStrategy::Sequential);
                assert_eq!(files, &vec!["src/lib.rs".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(orch.store().read_session().expect("session").is_some());
    }

    #[test]
    fn plain_mode_uses_timestamps_and_skips_vcs() {
        let orch = orchestrator();
        seed(&orch, "w1");
        orch.dispatch_enable("w1", false).expect("enable");
        let prepared = orch.dispatch_prepare("w1", "task").expect("prepare");
        assert!(DateTime::parse_from_rfc3339(&prepared.start_marker).is_ok());
        let outcome = orch
            .dispatch_complete("w1", "task", false, Some("gave up"))
            .expect("fail");
        assert_eq!(outcome.end_marker, None);
        let disabled = orch
            .dispatch_disable("w1", None, &DisableOptions::default())
            .expect("disable");
        assert!(!disabled.merged);
        assert!(orch.vcs().calls().is_empty());
        assert_eq!(
            orch.graph("w1").expect("graph").node("root").expect("root").status(),
            Status::Planning(PlanningStatus::Monitoring)
        );
    }
}
