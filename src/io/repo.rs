//! Isolated working-copy management.
//!
//! All edits happen in a second checkout under the cache root; the original
//! repository is never written. Version-controlled repos get a real git
//! worktree on a fresh `recast/<run_id>` branch sharing the object database;
//! unversioned repos are copied and a temporary repository is initialized
//! inside the copy.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::git::Git;
use crate::io::paths::{CacheLayout, STATE_DIR};

/// Directory names never copied into an unversioned worktree. The state dir
/// is recreated fresh; index artifacts are carried over separately.
const COPY_EXCLUDES: [&str; 8] = [
    ".git",
    ".recast",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "dist",
    "build",
];

/// Manages the isolated worktree for one run.
#[derive(Debug)]
pub struct RepoManager {
    repo_path: PathBuf,
    run_id: String,
    branch: String,
    is_git: bool,
    worktree: Option<PathBuf>,
    baseline: Option<String>,
}

impl RepoManager {
    pub fn new(repo_path: &Path, run_id: &str) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            run_id: run_id.to_string(),
            branch: format!("recast/{run_id}"),
            is_git: Git::is_repo(repo_path),
            worktree: None,
            baseline: None,
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Validate that the repository can be refactored at all.
    pub fn validate(&self) -> Result<()> {
        if !self.repo_path.is_dir() {
            return Err(anyhow!(
                "repository path is not a directory: {}",
                self.repo_path.display()
            ));
        }
        let mut entries = fs::read_dir(&self.repo_path)
            .with_context(|| format!("read {}", self.repo_path.display()))?;
        if entries.next().is_none() {
            return Err(anyhow!(
                "repository directory is empty: {}",
                self.repo_path.display()
            ));
        }
        if self.is_git {
            let git = Git::new(&self.repo_path);
            // Detached HEAD would leave the run branch unanchored.
            let branch = git.current_branch()?;
            if !git.status_porcelain()?.is_empty() {
                warn!(branch = %branch, "repository has uncommitted changes");
            }
        }
        Ok(())
    }

    /// Create the isolated worktree and record the baseline commit.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn prepare(&mut self, layout: &CacheLayout) -> Result<PathBuf> {
        layout.ensure()?;
        let worktree = layout.worktree_for(&self.run_id);
        if worktree.exists() {
            return Err(anyhow!(
                "stale worktree already exists at {} (remove it or use a new run)",
                worktree.display()
            ));
        }

        if self.is_git {
            let git = Git::new(&self.repo_path);
            git.create_branch(&self.branch)
                .with_context(|| format!("create branch {}", self.branch))?;
            git.worktree_add(&worktree, &self.branch)
                .context("materialize worktree")?;
        } else {
            info!("repository is unversioned, copying and initializing git");
            copy_tree(&self.repo_path, &worktree)?;
            let git = Git::new(&worktree);
            git.init()?;
            git.commit_all("recast baseline").context("baseline commit")?;
        }

        write_state_scaffold(&worktree)?;

        let baseline = Git::new(&worktree).rev_parse("HEAD")?;
        debug!(baseline = %baseline, worktree = %worktree.display(), "worktree prepared");
        self.baseline = Some(baseline);
        self.worktree = Some(worktree.clone());
        Ok(worktree)
    }

    pub fn worktree(&self) -> Result<&Path> {
        self.worktree
            .as_deref()
            .ok_or_else(|| anyhow!("worktree not prepared"))
    }

    /// The commit the worktree started at.
    pub fn baseline(&self) -> Result<&str> {
        self.baseline
            .as_deref()
            .ok_or_else(|| anyhow!("worktree not prepared"))
    }

    /// Refuse to start a batch on an externally mutated worktree.
    /// State-directory churn is expected and ignored.
    pub fn ensure_clean_for_batch(&self) -> Result<()> {
        let worktree = self.worktree()?;
        Git::new(worktree).ensure_clean_except_prefixes(&[STATE_DIR])
    }

    /// Create the checkpoint commit for a successfully verified batch.
    #[instrument(skip_all, fields(batch_id))]
    pub fn checkpoint_commit(&self, batch_id: &str, goal: &str) -> Result<String> {
        let worktree = self.worktree()?;
        let message = format!("checkpoint({batch_id}): {goal}");
        Git::new(worktree)
            .commit_all(&message)
            .with_context(|| format!("checkpoint commit for {batch_id}"))
    }

    /// Hard-reset the worktree to a prior checkpoint (or the baseline).
    pub fn reset_to(&self, commit: &str) -> Result<()> {
        let worktree = self.worktree()?;
        Git::new(worktree).reset_hard(commit)
    }

    /// Remove the worktree, or leave it in place for inspection.
    #[instrument(skip_all, fields(keep))]
    pub fn teardown(&mut self, keep: bool) -> Result<()> {
        let Some(worktree) = self.worktree.take() else {
            return Ok(());
        };
        if keep {
            info!(worktree = %worktree.display(), "worktree kept for inspection");
            self.worktree = Some(worktree);
            return Ok(());
        }
        if self.is_git {
            let git = Git::new(&self.repo_path);
            if let Err(err) = git.worktree_remove(&worktree) {
                warn!(%err, "git worktree remove failed, deleting directory");
                fs::remove_dir_all(&worktree)
                    .with_context(|| format!("remove {}", worktree.display()))?;
            }
        } else if worktree.exists() {
            fs::remove_dir_all(&worktree)
                .with_context(|| format!("remove {}", worktree.display()))?;
        }
        Ok(())
    }
}

/// Create the hidden state directory. It carries a self-ignoring `.gitignore`
/// so ledger and verification artifacts never leak into checkpoint commits.
fn write_state_scaffold(worktree: &Path) -> Result<()> {
    let state_dir = worktree.join(STATE_DIR);
    fs::create_dir_all(&state_dir)
        .with_context(|| format!("create {}", state_dir.display()))?;
    let gitignore = state_dir.join(".gitignore");
    if !gitignore.exists() {
        fs::write(&gitignore, "*\n")
            .with_context(|| format!("write {}", gitignore.display()))?;
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).with_context(|| format!("create {}", to.display()))?;
    for entry in fs::read_dir(from).with_context(|| format!("read {}", from.display()))? {
        let entry = entry.context("read dir entry")?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if COPY_EXCLUDES.iter().any(|ex| *ex == name_str) {
            continue;
        }
        let src = entry.path();
        let dst = to.join(&name);
        if src.is_dir() {
            copy_tree(&src, &dst)?;
        } else {
            fs::copy(&src, &dst)
                .with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
        }
    }
    Ok(())
}
