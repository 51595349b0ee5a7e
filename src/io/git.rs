//! Git adapter for the refactor pipeline.
//!
//! All isolation guarantees rest on git worktrees, checkpoints, and bundles,
//! so we keep a small, explicit wrapper around `git` subprocess calls rather
//! than binding a library.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if the directory is the top of a git repository.
    pub fn is_repo(path: &Path) -> bool {
        path.join(".git").is_dir()
    }

    /// Initialize a fresh repository with a deterministic committer identity.
    #[instrument(skip_all)]
    pub fn init(&self) -> Result<()> {
        self.run_checked(&["init", "--quiet"])?;
        self.run_checked(&["config", "user.email", "recast@localhost"])?;
        self.run_checked(&["config", "user.name", "recast"])?;
        Ok(())
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Resolve a refspec to a full commit SHA.
    pub fn rev_parse(&self, refspec: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", refspec])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the working tree is clean, allowing entries with any of the
    /// given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let entries = self.status_porcelain()?;
        let mut disallowed = Vec::new();
        for entry in entries {
            if allowed_prefixes
                .iter()
                .any(|prefix| entry.path.starts_with(prefix))
            {
                continue;
            }
            disallowed.push(entry);
        }
        if disallowed.is_empty() {
            debug!("working tree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "working tree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean (disallowed changes):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
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

    /// Create a branch at current HEAD without checking it out.
    #[instrument(skip_all, fields(branch))]
    pub fn create_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating branch at HEAD");
        self.run_checked(&["branch", branch])?;
        Ok(())
    }

    /// Materialize a second checkout of `branch` at `path`.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_add(&self, path: &Path, branch: &str) -> Result<()> {
        let path_str = path_arg(path)?;
        self.run_checked(&["worktree", "add", &path_str, branch])?;
        Ok(())
    }

    /// Remove a worktree registration and its directory.
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path_arg(path)?;
        self.run_checked(&["worktree", "remove", "--force", &path_str])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Stage everything and commit, returning the new commit SHA.
    ///
    /// Errors when there is nothing to commit: callers only checkpoint after a
    /// successful patch application, so an empty commit means external
    /// mutation of the working tree.
    #[instrument(skip_all)]
    pub fn commit_all(&self, message: &str) -> Result<String> {
        self.add_all()?;
        if !self.has_staged_changes()? {
            return Err(anyhow!("nothing to commit"));
        }
        self.run_checked(&["commit", "--quiet", "-m", message])?;
        self.rev_parse("HEAD")
    }

    /// Added/removed line counts of the unstaged diff against HEAD.
    pub fn diff_numstat(&self) -> Result<(usize, usize)> {
        let out = self.run_capture(&["diff", "--numstat", "HEAD"])?;
        let mut added = 0usize;
        let mut removed = 0usize;
        for line in out.lines() {
            let mut parts = line.split_whitespace();
            // Binary files show "-" in both columns; count them as zero.
            added += parts.next().and_then(|v| v.parse::<usize>().ok()).unwrap_or(0);
            removed += parts.next().and_then(|v| v.parse::<usize>().ok()).unwrap_or(0);
        }
        Ok((added, removed))
    }

    /// Hard-reset the working tree to a prior commit.
    #[instrument(skip_all, fields(refspec))]
    pub fn reset_hard(&self, refspec: &str) -> Result<()> {
        debug!(refspec, "hard reset");
        self.run_checked(&["reset", "--hard", "--quiet", refspec])?;
        Ok(())
    }

    /// Write a bundle containing all refs to `path`.
    pub fn bundle_create(&self, path: &Path) -> Result<()> {
        let path_str = path_arg(path)?;
        self.run_checked(&["bundle", "create", &path_str, "--all"])?;
        Ok(())
    }

    /// Clone a bundle into `target` (which must not exist yet).
    pub fn clone_from_bundle(bundle: &Path, target: &Path) -> Result<()> {
        let bundle_str = path_arg(bundle)?;
        let target_str = path_arg(target)?;
        let output = Command::new("git")
            .args(["clone", "--quiet", &bundle_str, &target_str])
            .output()
            .context("spawn git clone")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git clone from bundle failed: {}", stderr.trim()));
        }
        Ok(())
    }

    /// Dry-run a patch file; Ok(()) iff it would apply cleanly.
    pub fn apply_check(&self, patch_file: &Path) -> Result<()> {
        let patch_str = path_arg(patch_file)?;
        let output = self.run(&["apply", "--check", &patch_str])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("patch would not apply cleanly: {}", stderr.trim()));
        }
        Ok(())
    }

    /// Apply a patch file to the working tree.
    pub fn apply(&self, patch_file: &Path) -> Result<()> {
        let patch_str = path_arg(patch_file)?;
        let output = self.run(&["apply", &patch_str])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git apply failed: {}", stderr.trim()));
        }
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> Result<String> {
    path.to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("non-UTF-8 path {}", path.display()))
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: " M".to_string(),
                path: "src/main.rs".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn init_commit_and_reset_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        git.init().expect("init");

        fs::write(temp.path().join("a.txt"), "one\n").expect("write");
        let first = git.commit_all("first").expect("commit");

        fs::write(temp.path().join("a.txt"), "two\n").expect("write");
        let second = git.commit_all("second").expect("commit");
        assert_ne!(first, second);

        git.reset_hard(&first).expect("reset");
        let contents = fs::read_to_string(temp.path().join("a.txt")).expect("read");
        assert_eq!(contents, "one\n");
        assert_eq!(git.rev_parse("HEAD").expect("rev-parse"), first);
    }

    #[test]
    fn commit_all_rejects_clean_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        git.init().expect("init");
        fs::write(temp.path().join("a.txt"), "one\n").expect("write");
        git.commit_all("first").expect("commit");

        let err = git.commit_all("empty").unwrap_err();
        assert!(err.to_string().contains("nothing to commit"));
    }

    #[test]
    fn apply_check_rejects_mismatched_patch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(temp.path());
        git.init().expect("init");
        fs::write(temp.path().join("a.txt"), "unrelated\n").expect("write");
        git.commit_all("first").expect("commit");

        let patch = "\
--- a/a.txt
+++ b/a.txt
@@ -1 +1 @@
-something else
+changed
";
        let patch_path = temp.path().join("p.diff");
        fs::write(&patch_path, patch).expect("write patch");
        assert!(git.apply_check(&patch_path).is_err());
    }
}
