//! Project configuration stored under `.tasktree/config.toml`.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::layout::write_atomic;
use crate::core::context::ContextOptions;
use crate::core::types::MergeStrategy;

/// Project configuration (TOML).
///
/// Edited by humans; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProjectConfig {
    pub dispatch: DispatchConfig,
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Isolation branches are named `<branch_prefix>/<workspace>`.
    pub branch_prefix: String,

    /// Prefix for commits created on the isolation branch.
    pub commit_prefix: String,

    /// Strategy used by `dispatch disable` when none is given.
    pub default_merge_strategy: MergeStrategy,

    /// Remove the isolation branch after a sequential or squash merge.
    pub delete_branch_after_merge: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "tasktree/dispatch".to_string(),
            commit_prefix: "tasktree".to_string(),
            default_merge_strategy: MergeStrategy::Sequential,
            delete_branch_after_merge: false,
        }
    }
}

/// Defaults for context aggregation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub max_log_entries: usize,
    pub reverse_log: bool,
    pub include_log: bool,
    pub include_problem: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        let options = ContextOptions::default();
        Self {
            max_log_entries: options.max_log_entries,
            reverse_log: options.reverse_log,
            include_log: options.include_log,
            include_problem: options.include_problem,
        }
    }
}

impl ContextConfig {
    pub fn options(&self) -> ContextOptions {
        ContextOptions {
            include_log: self.include_log,
            max_log_entries: self.max_log_entries,
            reverse_log: self.reverse_log,
            include_problem: self.include_problem,
        }
    }
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<()> {
        let prefix = &self.dispatch.branch_prefix;
        if prefix.trim().is_empty() {
            return Err(anyhow!("dispatch.branch_prefix must be non-empty"));
        }
        if prefix.starts_with('/')
            || prefix.ends_with('/')
            || prefix.contains("..")
            || prefix.chars().any(|c| c.is_whitespace() || "~^:?*[\\".contains(c))
        {
            return Err(anyhow!(
                "dispatch.branch_prefix '{prefix}' is not a valid branch name prefix"
            ));
        }
        if self.dispatch.commit_prefix.trim().is_empty() {
            return Err(anyhow!("dispatch.commit_prefix must be non-empty"));
        }
        if self.context.max_log_entries == 0 {
            return Err(anyhow!(
                "context.max_log_entries must be > 0 (set include_log = false to hide logs)"
            ));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ProjectConfig::default()`.
pub fn load_config(path: &Path) -> Result<ProjectConfig> {
    if !path.exists() {
        let cfg = ProjectConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ProjectConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ProjectConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ProjectConfig::default());
        assert_eq!(cfg.context.options(), ContextOptions::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = ProjectConfig::default();
        cfg.dispatch.default_merge_strategy = MergeStrategy::CherryPick;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    /// Partial files keep defaults for every omitted field.
    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            "[dispatch]\ndefault_merge_strategy = \"squash\"\n\n[context]\nreverse_log = true\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.dispatch.default_merge_strategy, MergeStrategy::Squash);
        assert_eq!(cfg.dispatch.branch_prefix, "tasktree/dispatch");
        assert!(cfg.context.reverse_log);
        assert_eq!(cfg.context.max_log_entries, 20);
    }

    #[test]
    fn rejects_unsafe_branch_prefix() {
        let mut cfg = ProjectConfig::default();
        cfg.dispatch.branch_prefix = "bad prefix/".to_string();
        let err = cfg.validate().expect_err("invalid");
        assert!(err.to_string().contains("branch_prefix"));
    }
}
