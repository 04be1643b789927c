//! Version-control adapter used by the dispatch engine.
//!
//! The engine only talks to [`VcsAdapter`]; [`GitVcs`] implements it with a
//! small, explicit wrapper around `git` subprocess calls. Conflicts are typed
//! so callers can surface the affected files instead of a raw stderr dump.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::MergeStrategy;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("{} is not inside a git work tree", .0.display())]
    NotARepository(PathBuf),

    #[error("detached HEAD (refuse to dispatch)")]
    DetachedHead,

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("{operation} stopped on conflicts: {}", .files.join(", "))]
    Conflict {
        operation: String,
        files: Vec<String>,
    },

    #[error("spawn git {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result of folding the isolation branch into the base branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// False when there was nothing to bring over (or the strategy skipped it).
    pub merged: bool,
    /// Commit created on the target, if the strategy commits.
    pub commit: Option<String>,
}

/// Operations the dispatch engine needs from a version-control system.
pub trait VcsAdapter: Send + Sync {
    fn is_repository(&self) -> bool;
    /// Current branch name; errors on detached HEAD.
    fn current_branch(&self) -> Result<String, VcsError>;
    /// Full commit id of HEAD.
    fn head(&self) -> Result<String, VcsError>;
    fn branch_exists(&self, branch: &str) -> Result<bool, VcsError>;
    /// Switch to `branch`, creating it at HEAD when missing.
    fn create_isolation_branch(&self, branch: &str) -> Result<(), VcsError>;
    fn checkout(&self, branch: &str) -> Result<(), VcsError>;
    /// Stage everything and commit if anything changed; returns the new HEAD.
    fn commit(&self, message: &str) -> Result<String, VcsError>;
    /// Reset tracked files to `target` and remove untracked files.
    fn hard_reset(&self, target: &str) -> Result<(), VcsError>;
    /// Bring `source` into `target` using `strategy`, leaving `target` checked out.
    fn merge(
        &self,
        strategy: MergeStrategy,
        source: &str,
        target: &str,
        message: &str,
    ) -> Result<MergeOutcome, VcsError>;
    fn has_uncommitted_changes(&self) -> Result<bool, VcsError>;
    /// Paths changed between two revisions.
    fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>, VcsError>;
    fn delete_branch(&self, branch: &str) -> Result<(), VcsError>;
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// [`VcsAdapter`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitVcs {
    workdir: PathBuf,
}

impl GitVcs {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>, VcsError> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        Ok(out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(parse_status_line)
            .collect())
    }

    fn has_staged_changes(&self) -> Result<bool, VcsError> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    fn conflicted_files(&self) -> Result<Vec<String>, VcsError> {
        let out = self.run_capture(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(lines(&out))
    }

    /// Run a step that may stop on conflicts; on failure collect the
    /// conflicted paths, run the `abort` commands, and report a typed conflict.
    fn run_or_abort(&self, args: &[&str], abort: &[&[&str]]) -> Result<(), VcsError> {
        let output = self.run(args)?;
        if output.status.success() {
            return Ok(());
        }
        let files = self.conflicted_files().unwrap_or_default();
        for step in abort {
            if let Err(err) = self.run_checked(step) {
                warn!(error = %err, "cleanup after failed {} did not succeed", args[0]);
            }
        }
        if files.is_empty() {
            return Err(failed(args, &output));
        }
        warn!(files = files.len(), operation = args[0], "stopped on conflicts");
        Err(VcsError::Conflict {
            operation: args[0].to_string(),
            files,
        })
    }

    fn merge_sequential(&self, source: &str, target: &str) -> Result<MergeOutcome, VcsError> {
        self.checkout(source)?;
        self.run_or_abort(&["rebase", target], &[&["rebase", "--abort"]])?;
        self.checkout(target)?;
        let before = self.head()?;
        self.run_checked(&["merge", "--ff-only", source])?;
        let after = self.head()?;
        Ok(MergeOutcome {
            merged: before != after,
            commit: (before != after).then_some(after),
        })
    }

    fn merge_squash(&self, source: &str, target: &str, message: &str) -> Result<MergeOutcome, VcsError> {
        self.checkout(target)?;
        self.run_or_abort(&["merge", "--squash", source], &[&["reset", "--hard", "HEAD"]])?;
        if !self.has_staged_changes()? {
            debug!("squash produced no changes");
            return Ok(MergeOutcome {
                merged: false,
                commit: None,
            });
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(MergeOutcome {
            merged: true,
            commit: Some(self.head()?),
        })
    }

    fn merge_cherry_pick(&self, source: &str, target: &str) -> Result<MergeOutcome, VcsError> {
        self.checkout(target)?;
        let range = format!("{target}..{source}");
        let count = self.run_capture(&["rev-list", "--count", &range])?;
        if count.trim() == "0" {
            debug!("no commits to cherry-pick");
            return Ok(MergeOutcome {
                merged: false,
                commit: None,
            });
        }
        self.run_or_abort(
            &["cherry-pick", "--no-commit", &range],
            &[&["cherry-pick", "--quit"], &["reset", "--hard", "HEAD"]],
        )?;
        Ok(MergeOutcome {
            merged: true,
            commit: None,
        })
    }

    fn run_capture(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output, VcsError> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(failed(args, &output));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output, VcsError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(|source| VcsError::Spawn {
                command: args.join(" "),
                source,
            })
    }
}

impl VcsAdapter for GitVcs {
    fn is_repository(&self) -> bool {
        self.run_capture(&["rev-parse", "--is-inside-work-tree"])
            .is_ok_and(|out| out.trim() == "true")
    }

    #[instrument(skip_all)]
    fn current_branch(&self) -> Result<String, VcsError> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(VcsError::DetachedHead);
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    fn head(&self) -> Result<String, VcsError> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, VcsError> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    #[instrument(skip_all, fields(branch))]
    fn create_isolation_branch(&self, branch: &str) -> Result<(), VcsError> {
        if self.branch_exists(branch)? {
            debug!(branch, "switching to existing isolation branch");
            return self.checkout(branch);
        }
        debug!(branch, "creating isolation branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    fn checkout(&self, branch: &str) -> Result<(), VcsError> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn commit(&self, message: &str) -> Result<String, VcsError> {
        self.run_checked(&["add", "-A"])?;
        if self.has_staged_changes()? {
            debug!("committing staged changes");
            self.run_checked(&["commit", "-m", message])?;
        } else {
            debug!("no staged changes, skipping commit");
        }
        self.head()
    }

    #[instrument(skip_all, fields(target))]
    fn hard_reset(&self, target: &str) -> Result<(), VcsError> {
        debug!(target, "rolling back working tree");
        self.run_checked(&["reset", "--hard", target])?;
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    #[instrument(skip_all, fields(strategy = %strategy, source, target))]
    fn merge(
        &self,
        strategy: MergeStrategy,
        source: &str,
        target: &str,
        message: &str,
    ) -> Result<MergeOutcome, VcsError> {
        match strategy {
            MergeStrategy::Sequential => self.merge_sequential(source, target),
            MergeStrategy::Squash => self.merge_squash(source, target, message),
            MergeStrategy::CherryPick => self.merge_cherry_pick(source, target),
            MergeStrategy::Skip => {
                self.checkout(target)?;
                Ok(MergeOutcome {
                    merged: false,
                    commit: None,
                })
            }
        }
    }

    fn has_uncommitted_changes(&self) -> Result<bool, VcsError> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    fn changed_files(&self, from: &str, to: &str) -> Result<Vec<String>, VcsError> {
        let out = self.run_capture(&["diff", "--name-only", from, to])?;
        Ok(lines(&out))
    }

    #[instrument(skip_all, fields(branch))]
    fn delete_branch(&self, branch: &str) -> Result<(), VcsError> {
        debug!(branch, "deleting branch");
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }
}

fn failed(args: &[&str], output: &Output) -> VcsError {
    VcsError::CommandFailed {
        command: args.join(" "),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_status_line(line: &str) -> Option<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Some(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return None;
    }
    let code = line.get(..2)?.to_string();
    let mut path = line.get(3..)?.trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Some(StatusEntry { code, path })
}
