//! Test-only helpers: deterministic nodes and graphs, a scripted VCS fake, and
//! a scratch git repository.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::core::types::MergeStrategy;
use crate::graph::{ExecutionStatus, Graph, Node, NodeKind, PlanningStatus, Status};
use crate::io::layout::{InitOptions, ProjectPaths, init_project};
use crate::io::vcs::{MergeOutcome, VcsAdapter, VcsError};

/// Fixed timestamp used by every builder so serialized output is stable.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

fn node(id: &str, kind: NodeKind, parent: Option<&str>, status: Status) -> Node {
    let mut node = Node::new(
        id,
        kind,
        parent.map(str::to_string),
        format!("{id} title"),
        fixed_now(),
    );
    node.set_status(status).expect("status matches node kind");
    if status.is_terminal() {
        node.conclusion = Some("done".to_string());
    }
    node
}

/// Planning node with the given status; terminal nodes carry conclusion "done".
pub fn planning_node(id: &str, parent: Option<&str>, status: PlanningStatus) -> Node {
    node(id, NodeKind::Planning, parent, Status::Planning(status))
}

/// Execution node with the given status; terminal nodes carry conclusion "done".
pub fn execution_node(id: &str, parent: Option<&str>, status: ExecutionStatus) -> Node {
    node(id, NodeKind::Execution, parent, Status::Execution(status))
}

/// Build a graph from nodes listed parents-first, wiring `children` from
/// `parent_id`. The first parentless node becomes the root.
pub fn graph_of(nodes: Vec<Node>) -> Graph {
    let mut graph = Graph::default();
    for node in nodes {
        match &node.parent_id {
            Some(parent_id) => {
                if let Some(parent) = graph.node_mut(parent_id) {
                    parent.children.push(node.id.clone());
                }
            }
            None => {
                if graph.root_id.is_none() {
                    graph.root_id = Some(node.id.clone());
                }
            }
        }
        graph.nodes.insert(node.id.clone(), node);
    }
    graph
}

/// Scripted, in-memory [`VcsAdapter`].
///
/// Tracks branches, a linear commit counter and a dirty flag; records every
/// mutating call so tests can assert which VCS operations ran.
#[derive(Debug)]
pub struct FakeVcs {
    state: Mutex<FakeState>,
}

#[derive(Debug)]
struct FakeState {
    repository: bool,
    branch: String,
    branches: BTreeSet<String>,
    head: u32,
    dirty: bool,
    conflict_files: Option<Vec<String>>,
    fail_operation: Option<String>,
    calls: Vec<String>,
}

impl Default for FakeVcs {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState {
                repository: true,
                branch: "main".to_string(),
                branches: BTreeSet::from(["main".to_string()]),
                head: 1,
                dirty: false,
                conflict_files: None,
                fail_operation: None,
                calls: Vec::new(),
            }),
        }
    }
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fake whose working directory is not a repository.
    pub fn without_repository() -> Self {
        let fake = Self::default();
        fake.with_state(|state| state.repository = false);
        fake
    }

    /// Make the next merge stop on conflicts in `files`.
    pub fn conflict_on_merge(&self, files: &[&str]) {
        self.with_state(|state| {
            state.conflict_files = Some(files.iter().map(|f| f.to_string()).collect());
        });
    }

    /// Make every call named `operation` fail.
    pub fn fail_on(&self, operation: &str) {
        self.with_state(|state| state.fail_operation = Some(operation.to_string()));
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.with_state(|state| state.dirty = dirty);
    }

    /// Mutating calls made so far, e.g. `"commit"`, `"merge squash"`.
    pub fn calls(&self) -> Vec<String> {
        self.with_state(|state| state.calls.clone())
    }

    pub fn current(&self) -> String {
        self.with_state(|state| state.branch.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut state)
    }

    fn guard(&self, operation: &str) -> Result<(), VcsError> {
        self.with_state(|state| {
            if state.fail_operation.as_deref() == Some(operation) {
                return Err(VcsError::CommandFailed {
                    command: operation.to_string(),
                    stderr: "scripted failure".to_string(),
                });
            }
            if !state.repository {
                return Err(VcsError::NotARepository(PathBuf::from(".")));
            }
            Ok(())
        })
    }

    fn record(&self, call: String) {
        self.with_state(|state| state.calls.push(call));
    }
}

impl VcsAdapter for FakeVcs {
    fn is_repository(&self) -> bool {
        self.with_state(|state| state.repository)
    }

    fn current_branch(&self) -> Result<String, VcsError> {
        self.guard("current_branch")?;
        Ok(self.current())
    }

    fn head(&self) -> Result<String, VcsError> {
        self.guard("head")?;
        Ok(self.with_state(|state| format!("c{}", state.head)))
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, VcsError> {
        self.guard("branch_exists")?;
        Ok(self.with_state(|state| state.branches.contains(branch)))
    }

    fn create_isolation_branch(&self, branch: &str) -> Result<(), VcsError> {
        self.guard("create_isolation_branch")?;
        self.record(format!("isolate {branch}"));
        self.with_state(|state| {
            state.branches.insert(branch.to_string());
            state.branch = branch.to_string();
        });
        Ok(())
    }

    fn checkout(&self, branch: &str) -> Result<(), VcsError> {
        self.guard("checkout")?;
        self.record(format!("checkout {branch}"));
        self.with_state(|state| state.branch = branch.to_string());
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<String, VcsError> {
        self.guard("commit")?;
        self.record(format!("commit {}", message.lines().next().unwrap_or_default()));
        Ok(self.with_state(|state| {
            state.head += 1;
            state.dirty = false;
            format!("c{}", state.head)
        }))
    }

    fn hard_reset(&self, target: &str) -> Result<(), VcsError> {
        self.guard("hard_reset")?;
        self.record(format!("reset {target}"));
        self.with_state(|state| state.dirty = false);
        Ok(())
    }

    fn merge(
        &self,
        strategy: MergeStrategy,
        source: &str,
        target: &str,
        _message: &str,
    ) -> Result<MergeOutcome, VcsError> {
        self.guard("merge")?;
        self.record(format!("merge {strategy} {source} -> {target}"));
        if let Some(files) = self.with_state(|state| state.conflict_files.take()) {
            return Err(VcsError::Conflict {
                operation: format!("merge {strategy}"),
                files,
            });
        }
        let commit = self.with_state(|state| {
            state.branch = target.to_string();
            if strategy == MergeStrategy::CherryPick {
                state.dirty = true;
                None
            } else {
                state.head += 1;
                Some(format!("c{}", state.head))
            }
        });
        Ok(MergeOutcome {
            merged: true,
            commit,
        })
    }

    fn has_uncommitted_changes(&self) -> Result<bool, VcsError> {
        self.guard("has_uncommitted_changes")?;
        Ok(self.with_state(|state| state.dirty))
    }

    fn changed_files(&self, _from: &str, _to: &str) -> Result<Vec<String>, VcsError> {
        self.guard("changed_files")?;
        Ok(Vec::new())
    }

    fn delete_branch(&self, branch: &str) -> Result<(), VcsError> {
        self.guard("delete_branch")?;
        self.record(format!("delete {branch}"));
        self.with_state(|state| {
            state.branches.remove(branch);
        });
        Ok(())
    }
}

/// Temporary git repository with an initial commit on `main` and an
/// initialized `.tasktree/` directory.
pub struct TestRepo {
    dir: TempDir,
    pub paths: ProjectPaths,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        git(&root, &["init", "-q"]);
        git(&root, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&root, &["config", "user.email", "tasktree@example.com"]);
        git(&root, &["config", "user.name", "tasktree"]);
        git(&root, &["config", "commit.gpgsign", "false"]);
        std::fs::write(root.join("README.md"), "seed\n").expect("write readme");
        let paths = init_project(&root, &InitOptions { force: false }).expect("init project");
        git(&root, &["add", "-A"]);
        git(&root, &["commit", "-q", "-m", "initial"]);
        Self { dir, paths }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(path, contents).expect("write file");
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.path().join(rel)).ok()
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> String {
        git(self.path(), args)
    }

    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", message]);
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
