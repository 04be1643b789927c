//! Graph persistence: the [`GraphStore`] seam plus file and in-memory stores.
//!
//! Stores replace whole graphs. Readers therefore always observe a complete
//! snapshot: files are swapped by rename, memory under an `RwLock`.
//!
//! Writers are serialized by the orchestrator, which also takes the store's
//! own locks. For [`FileStore`] those are `flock`-style exclusive locks on
//! files next to the data, so separate processes on one project queue up
//! behind each other.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, instrument, trace};

use super::layout::{ProjectPaths, ensure_layout, write_atomic};
use crate::core::invariants::validate_graph;
use crate::graph::{DispatchSession, Graph};

pub const GRAPH_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/graph.schema.json"
));

/// Whole-graph persistence for the workspaces of one project.
pub trait GraphStore: Send + Sync {
    /// Read a workspace graph. A workspace that was never written is empty.
    fn read_graph(&self, workspace: &str) -> Result<Graph>;
    /// Replace a workspace graph in one write.
    fn write_graph(&self, workspace: &str, graph: &Graph) -> Result<()>;
    /// Workspaces with a stored graph, sorted.
    fn list_workspaces(&self) -> Result<Vec<String>>;
    fn read_session(&self) -> Result<Option<DispatchSession>>;
    /// Store the project dispatch session; `None` clears it.
    fn write_session(&self, session: Option<&DispatchSession>) -> Result<()>;

    /// Block until this caller is the only writer of `workspace`.
    ///
    /// Stores that live inside one process can rely on the orchestrator's
    /// mutexes and keep the default.
    fn lock_workspace(&self, _workspace: &str) -> Result<StoreLock> {
        Ok(StoreLock::default())
    }

    /// Block until this caller holds the project dispatch lock.
    fn lock_dispatch(&self) -> Result<StoreLock> {
        Ok(StoreLock::default())
    }
}

/// Exclusive lock on a lock file, released on drop.
#[derive(Debug, Default)]
pub struct StoreLock {
    file: Option<File>,
}

impl StoreLock {
    /// Open (creating if needed) and exclusively lock `path`, waiting for any
    /// other holder.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        FileExt::lock_exclusive(&file).with_context(|| format!("lock {}", path.display()))?;
        trace!(path = %path.display(), "lock acquired");
        Ok(Self { file: Some(file) })
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let Some(file) = &self.file else {
            return;
        };
        if let Err(err) = FileExt::unlock(file) {
            debug!(error = %err, "unlock failed; closing the file releases it");
        }
    }
}

/// JSON files under `.tasktree/`, validated on every load.
#[derive(Debug, Clone)]
pub struct FileStore {
    paths: ProjectPaths,
}

impl FileStore {
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths }
    }

    pub fn open(root: &Path) -> Self {
        Self::new(ProjectPaths::new(root))
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }
}

impl GraphStore for FileStore {
    #[instrument(skip_all, fields(workspace))]
    fn read_graph(&self, workspace: &str) -> Result<Graph> {
        let path = self.paths.graph_path(workspace);
        if !path.exists() {
            debug!(workspace, "no graph stored yet");
            return Ok(Graph::default());
        }
        load_graph(&path)
    }

    #[instrument(skip_all, fields(workspace))]
    fn write_graph(&self, workspace: &str, graph: &Graph) -> Result<()> {
        ensure_layout(&self.paths)?;
        let path = self.paths.graph_path(workspace);
        let mut buf = serde_json::to_string_pretty(graph).context("serialize graph")?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        debug!(workspace, nodes = graph.nodes.len(), "graph written");
        Ok(())
    }

    fn list_workspaces(&self) -> Result<Vec<String>> {
        let dir = &self.paths.workspaces_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            if !entry.path().join("graph.json").is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    fn read_session(&self) -> Result<Option<DispatchSession>> {
        let path = &self.paths.session_path;
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let session = serde_json::from_str(&contents)
            .with_context(|| format!("parse dispatch session {}", path.display()))?;
        Ok(Some(session))
    }

    fn write_session(&self, session: Option<&DispatchSession>) -> Result<()> {
        let path = &self.paths.session_path;
        match session {
            Some(session) => {
                ensure_layout(&self.paths)?;
                let mut buf =
                    serde_json::to_string_pretty(session).context("serialize dispatch session")?;
                buf.push('\n');
                write_atomic(path, &buf)
            }
            None if path.exists() => {
                fs::remove_file(path).with_context(|| format!("remove {}", path.display()))
            }
            None => Ok(()),
        }
    }

    fn lock_workspace(&self, workspace: &str) -> Result<StoreLock> {
        ensure_layout(&self.paths)?;
        StoreLock::acquire(&self.paths.workspace_lock_path(workspace))
    }

    fn lock_dispatch(&self) -> Result<StoreLock> {
        ensure_layout(&self.paths)?;
        StoreLock::acquire(&self.paths.dispatch_lock_path)
    }
}

/// Load and validate a graph file (schema + invariants).
pub fn load_graph(path: &Path) -> Result<Graph> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read graph {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse graph {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate graph {}", path.display()))?;
    let graph: Graph = serde_json::from_value(value)
        .with_context(|| format!("deserialize graph {}", path.display()))?;
    let errors = validate_graph(&graph);
    if !errors.is_empty() {
        return Err(anyhow!(
            "graph invariants failed for {}: {}",
            path.display(),
            errors.join("; ")
        ));
    }
    Ok(graph)
}

/// Validate a graph document against the embedded JSON Schema (Draft 2020-12).
pub fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(GRAPH_SCHEMA).context("parse graph schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("invalid schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    graphs: RwLock<BTreeMap<String, Graph>>,
    session: RwLock<Option<DispatchSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphStore for MemoryStore {
    fn read_graph(&self, workspace: &str) -> Result<Graph> {
        let graphs = self.graphs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(graphs.get(workspace).cloned().unwrap_or_default())
    }

    fn write_graph(&self, workspace: &str, graph: &Graph) -> Result<()> {
        let mut graphs = self.graphs.write().unwrap_or_else(PoisonError::into_inner);
        graphs.insert(workspace.to_string(), graph.clone());
        Ok(())
    }

    fn list_workspaces(&self) -> Result<Vec<String>> {
        let graphs = self.graphs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(graphs.keys().cloned().collect())
    }

    fn read_session(&self) -> Result<Option<DispatchSession>> {
        let session = self.session.read().unwrap_or_else(PoisonError::into_inner);
        Ok(session.clone())
    }

    fn write_session(&self, session: Option<&DispatchSession>) -> Result<()> {
        let mut slot = self.session.write().unwrap_or_else(PoisonError::into_inner);
        *slot = session.cloned();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ExecutionStatus, PlanningStatus};
    use crate::test_support::{execution_node, fixed_now, graph_of, planning_node};

    fn sample() -> Graph {
        graph_of(vec![
            planning_node("root", None, PlanningStatus::Monitoring),
            execution_node("a", Some("root"), ExecutionStatus::Completed),
        ])
    }

    /// Write then read returns the same graph through schema and invariant checks.
    #[test]
    fn file_store_round_trips_graphs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(temp.path());
        assert!(store.read_graph("w1").expect("empty").is_empty());

        store.write_graph("w1", &sample()).expect("write");
        assert_eq!(store.read_graph("w1").expect("read"), sample());
        assert_eq!(store.list_workspaces().expect("list"), vec!["w1"]);
        assert!(store.paths().gitignore_path.is_file());
    }

    #[test]
    fn file_store_rejects_invariant_violations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(temp.path());
        let mut graph = sample();
        graph.node_mut("a").expect("a").conclusion = None;
        store.write_graph("w1", &graph).expect("write");

        let err = store.read_graph("w1").expect_err("invalid");
        assert!(format!("{err:#}").contains("requires a conclusion"));
    }

    #[test]
    fn schema_rejects_status_of_other_kind() {
        let mut value = serde_json::to_value(sample()).expect("serialize");
        value["nodes"]["a"]["status"] = Value::from("monitoring");
        let err = validate_schema(&value).expect_err("schema");
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn session_is_cleared_by_writing_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(temp.path());
        let session = DispatchSession {
            workspace: "w1".to_string(),
            use_version_control: false,
            base_branch: None,
            isolation_branch: None,
            enabled_at: fixed_now(),
        };
        store.write_session(Some(&session)).expect("write");
        assert_eq!(store.read_session().expect("read"), Some(session));
        store.write_session(None).expect("clear");
        assert_eq!(store.read_session().expect("read"), None);
        store.write_session(None).expect("clear twice");
    }

    #[test]
    fn memory_store_isolates_workspaces() {
        let store = MemoryStore::new();
        store.write_graph("w1", &sample()).expect("write");
        assert!(store.read_graph("w2").expect("read").is_empty());
        assert_eq!(store.list_workspaces().expect("list"), vec!["w1"]);
        assert!(!store.lock_workspace("w1").expect("no-op lock").is_held());
    }

    #[test]
    fn workspace_lock_excludes_other_handles_until_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(temp.path());
        let lock = store.lock_workspace("w1").expect("lock");
        assert!(lock.is_held());

        let other = File::open(store.paths().workspace_lock_path("w1")).expect("open");
        assert!(FileExt::try_lock_exclusive(&other).is_err());
        drop(lock);
        FileExt::try_lock_exclusive(&other).expect("released");

        // A lock file alone does not make a workspace.
        assert!(store.list_workspaces().expect("list").is_empty());
    }

    #[test]
    fn dispatch_lock_lives_in_state_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(temp.path());
        let _lock = store.lock_dispatch().expect("lock");
        assert!(store.paths().dispatch_lock_path.is_file());
        assert!(store.paths().dispatch_lock_path.starts_with(&store.paths().state_dir));
    }
}
