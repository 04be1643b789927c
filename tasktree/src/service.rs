//! Orchestrator: serialized graph mutations on top of a store.
//!
//! Every mutation runs read -> plan -> apply -> write while holding the
//! workspace's lock, so transitions in one workspace apply in lock order and a
//! cascade lands in the same write as its primary change. A lock is an
//! in-process mutex plus the store's own lock, which for the file store also
//! excludes other processes. Different workspaces never wait on each other.
//! Context reads take no lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::core::context::{ContextOptions, ContextView, aggregate};
use crate::core::creation::{CreationPlan, NewNode, apply_creation, plan_creation};
use crate::core::edits;
use crate::core::ids::validate_id;
use crate::core::state_machine::{apply_transition, plan_transition};
use crate::core::types::{Action, TransitionOutcome};
use crate::error::{Error, Result};
use crate::graph::{Document, Graph};
use crate::io::config::ProjectConfig;
use crate::io::store::{GraphStore, StoreLock};
use crate::io::vcs::VcsAdapter;

/// Registry of per-workspace mutexes, created on first use.
#[derive(Debug, Default)]
pub(crate) struct WorkspaceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkspaceLocks {
    fn lock_for(&self, workspace: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(workspace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Project dispatch lock; the store lock is released before the mutex.
pub(crate) struct DispatchGuard<'a> {
    _store: StoreLock,
    _local: MutexGuard<'a, ()>,
}

pub struct Orchestrator<S, V> {
    pub(crate) store: S,
    pub(crate) vcs: V,
    pub(crate) config: ProjectConfig,
    pub(crate) workspaces: WorkspaceLocks,
    /// Held for the whole of every dispatch operation. Taken before any
    /// workspace lock.
    pub(crate) dispatch_lock: Mutex<()>,
}

impl<S: GraphStore, V: VcsAdapter> Orchestrator<S, V> {
    pub fn new(store: S, vcs: V, config: ProjectConfig) -> Self {
        Self {
            store,
            vcs,
            config,
            workspaces: WorkspaceLocks::default(),
            dispatch_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Context options configured for this project.
    pub fn default_context_options(&self) -> ContextOptions {
        self.config.context.options()
    }

    /// Current snapshot of a workspace graph.
    pub fn graph(&self, workspace: &str) -> Result<Graph> {
        validate_id(workspace)?;
        Ok(self.store.read_graph(workspace)?)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Run `f` while holding the workspace's write lock.
    pub(crate) fn locked<T>(&self, workspace: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        validate_id(workspace)?;
        let lock = self.workspaces.lock_for(workspace);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _store = self.store.lock_workspace(workspace)?;
        f()
    }

    /// Take the project dispatch lock. Must be taken before any workspace lock.
    pub(crate) fn dispatch_guard(&self) -> Result<DispatchGuard<'_>> {
        let local = self
            .dispatch_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let store = self.store.lock_dispatch()?;
        Ok(DispatchGuard {
            _store: store,
            _local: local,
        })
    }

    /// Read the graph, let `f` edit a copy, and write it back if it changed.
    ///
    /// An error from `f` discards the copy, so nothing is partially applied.
    pub(crate) fn mutate<T>(
        &self,
        workspace: &str,
        f: impl FnOnce(&mut Graph, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        self.locked(workspace, || {
            let current = self.store.read_graph(workspace)?;
            let mut next = current.clone();
            let out = f(&mut next, self.now())?;
            if next != current {
                self.store.write_graph(workspace, &next)?;
            }
            Ok(out)
        })
    }

    /// Apply `action` to a node, including its ancestor cascade.
    ///
    /// A node with an active dispatch only leaves it through
    /// `dispatch_complete` or `dispatch_verify`.
    #[instrument(skip_all, fields(workspace, node_id, action = %action))]
    pub fn transition(
        &self,
        workspace: &str,
        node_id: &str,
        action: Action,
        conclusion: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let outcome = self.mutate(workspace, |graph, now| {
            if graph.require(node_id)?.has_active_dispatch() {
                return Err(Error::DispatchConcurrencyConflict {
                    workspace: workspace.to_string(),
                    node_id: Some(node_id.to_string()),
                });
            }
            let outcome = plan_transition(graph, node_id, action, conclusion)?;
            apply_transition(graph, &outcome, now)?;
            Ok(outcome)
        })?;
        info!(
            workspace,
            node_id,
            from = %outcome.previous_status,
            to = %outcome.current_status,
            cascade = outcome.cascade.len(),
            "transition applied"
        );
        Ok(outcome)
    }

    /// Create a node under the creation rules (parent checks, implicit reopen).
    #[instrument(skip_all, fields(workspace, node_id = %new.id))]
    pub fn create_node(&self, workspace: &str, new: NewNode) -> Result<CreationPlan> {
        let plan = self.mutate(workspace, |graph, now| {
            let plan = plan_creation(graph, new, now)?;
            apply_creation(graph, &plan, now)?;
            Ok(plan)
        })?;
        debug!(workspace, node_id = %plan.node.id, cascade = plan.cascade.len(), "node created");
        Ok(plan)
    }

    /// Remove a node and its subtree; returns the removed ids.
    pub fn remove_node(&self, workspace: &str, node_id: &str) -> Result<Vec<String>> {
        self.mutate(workspace, |graph, _| {
            edits::remove_subtree(graph, workspace, node_id)
        })
    }

    pub fn add_reference(&self, workspace: &str, node_id: &str, target: &str) -> Result<bool> {
        self.mutate(workspace, |graph, now| {
            edits::add_reference(graph, node_id, target, now)
        })
    }

    pub fn expire_reference(&self, workspace: &str, node_id: &str, target: &str) -> Result<()> {
        self.mutate(workspace, |graph, now| {
            edits::expire_reference(graph, node_id, target, now)
        })
    }

    pub fn add_document(&self, workspace: &str, node_id: &str, document: Document) -> Result<()> {
        self.mutate(workspace, |graph, now| {
            edits::add_document(graph, node_id, document, now)
        })
    }

    pub fn expire_document(&self, workspace: &str, node_id: &str, document_id: &str) -> Result<()> {
        self.mutate(workspace, |graph, now| {
            edits::expire_document(graph, node_id, document_id, now)
        })
    }

    pub fn append_log(&self, workspace: &str, node_id: &str, message: &str) -> Result<()> {
        self.mutate(workspace, |graph, now| {
            edits::append_log(graph, node_id, message, now)
        })
    }

    pub fn set_isolate(&self, workspace: &str, node_id: &str, isolate: bool) -> Result<()> {
        self.mutate(workspace, |graph, now| {
            edits::set_isolate(graph, node_id, isolate, now)
        })
    }

    /// Build the context view for a node from one snapshot.
    pub fn get_context(
        &self,
        workspace: &str,
        node_id: &str,
        options: &ContextOptions,
    ) -> Result<ContextView> {
        let graph = self.graph(workspace)?;
        aggregate(&graph, node_id, options)
    }
}
