//! `.tasktree/` layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{ProjectConfig, write_config};

/// Everything under `.tasktree/` is runtime state and must never be committed,
/// staged by a dispatch commit, or removed by a rollback.
pub const TASKTREE_GITIGNORE: &str = "*\n";

/// All canonical paths within `.tasktree/` for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub tasktree_dir: PathBuf,
    pub state_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub session_path: PathBuf,
    /// Held by every dispatch operation, across processes.
    pub dispatch_lock_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let tasktree_dir = root.join(".tasktree");
        let state_dir = tasktree_dir.join("state");
        Self {
            root: root.clone(),
            tasktree_dir: tasktree_dir.clone(),
            state_dir: state_dir.clone(),
            workspaces_dir: tasktree_dir.join("workspaces"),
            gitignore_path: tasktree_dir.join(".gitignore"),
            config_path: tasktree_dir.join("config.toml"),
            session_path: state_dir.join("dispatch.json"),
            dispatch_lock_path: state_dir.join("dispatch.lock"),
        }
    }

    pub fn workspace_dir(&self, workspace: &str) -> PathBuf {
        self.workspaces_dir.join(workspace)
    }

    pub fn graph_path(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join("graph.json")
    }

    pub fn workspace_lock_path(&self, workspace: &str) -> PathBuf {
        self.workspace_dir(workspace).join("graph.lock")
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, rewrite the config and `.gitignore` of an existing `.tasktree/`.
    pub force: bool,
}

/// Create `.tasktree/` scaffolding in `root`.
///
/// Fails if `.tasktree/` already exists unless `options.force` is set.
/// Workspace graphs are never touched.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<ProjectPaths> {
    let paths = ProjectPaths::new(root);
    if paths.tasktree_dir.exists() && !paths.tasktree_dir.is_dir() {
        return Err(anyhow!(
            "tasktree init: .tasktree exists but is not a directory"
        ));
    }
    if paths.tasktree_dir.exists() && !options.force {
        return Err(anyhow!(
            "tasktree init: .tasktree already exists (use --force to overwrite)"
        ));
    }

    ensure_layout(&paths)?;
    write_file(&paths.gitignore_path, TASKTREE_GITIGNORE)?;
    write_config(&paths.config_path, &ProjectConfig::default())?;
    Ok(paths)
}

/// Create the directories and `.gitignore` if they are missing.
pub fn ensure_layout(paths: &ProjectPaths) -> Result<()> {
    create_dir(&paths.tasktree_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&paths.workspaces_dir)?;
    if !paths.gitignore_path.exists() {
        write_file(&paths.gitignore_path, TASKTREE_GITIGNORE)?;
    }
    Ok(())
}

/// Replace `path` via a sibling temp file so readers never see partial writes.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    create_dir(parent)?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}
