//! Cache-root layout for worktrees and backups, plus run identifiers.
//!
//! Everything recast persists outside the worktree lives under a single cache
//! root: `~/.recast` by default, overridable with `RECAST_HOME`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};

pub const CACHE_ENV: &str = "RECAST_HOME";

/// Name of the hidden state directory inside the worktree.
pub const STATE_DIR: &str = ".recast";

/// Resolved cache-root directory layout.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Resolve the cache root from `RECAST_HOME` or the user's home directory.
    pub fn resolve() -> Result<Self> {
        if let Ok(root) = std::env::var(CACHE_ENV) {
            if !root.trim().is_empty() {
                return Ok(Self { root: PathBuf::from(root) });
            }
        }
        let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
        Ok(Self {
            root: home.join(".recast"),
        })
    }

    /// Build a layout rooted at an explicit directory (tests, embedding).
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn worktree_for(&self, run_id: &str) -> PathBuf {
        self.worktrees_dir().join(run_id)
    }

    pub fn backup_for(&self, repo_name: &str, run_id: &str) -> PathBuf {
        self.backups_dir().join(repo_name).join(run_id)
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.root, &self.worktrees_dir(), &self.backups_dir()] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// A clean repository name derived from its path.
pub fn repo_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string())
}

/// Generate a time-sortable run id: `YYYYMMDD-HHMMSS-<suffix>`.
pub fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{timestamp}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_stable() {
        let layout = CacheLayout::from_root("/tmp/recast-home");
        assert_eq!(
            layout.worktree_for("20260101-010101-abcdef"),
            PathBuf::from("/tmp/recast-home/worktrees/20260101-010101-abcdef")
        );
        assert_eq!(
            layout.backup_for("myrepo", "run-1"),
            PathBuf::from("/tmp/recast-home/backups/myrepo/run-1")
        );
    }

    #[test]
    fn run_ids_are_sortable_and_unique() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), "20260101-010101-abcdef".len());
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn repo_name_uses_final_component() {
        assert_eq!(repo_name(Path::new("/home/me/projects/widget")), "widget");
    }
}
