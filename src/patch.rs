//! Patch validation and application.
//!
//! A proposal never touches the filesystem until every constraint holds:
//! scope, budget, binary policy, internal consistency, and a dry-run apply.
//! Formatting-only batches are the exception to the agent path entirely:
//! their edits come from the configured formatter command.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::diffstat::{self, DiffStats};
use crate::core::scope::ScopeMatcher;
use crate::core::types::{Batch, PatchProposal};
use crate::io::cancel::CancelToken;
use crate::io::config::RunConfig;
use crate::io::git::Git;
use crate::io::paths::STATE_DIR;
use crate::io::process::run_command_with_timeout;

/// Outcome of one application attempt.
///
/// The two rejection kinds matter to the orchestrator: a proposal that
/// violates batch constraints is the agent's failure to conform (the batch
/// ends `blocked` once retries run out, and the run continues), while a
/// conforming patch that will not apply is an apply failure (persistent
/// apply failure aborts the run).
#[derive(Debug)]
pub enum ApplyOutcome {
    /// The patch passed validation and now sits in the working tree.
    Applied(DiffStats),
    /// Proposal violates batch constraints (scope, budget, binary, shape).
    /// The working tree is untouched.
    Constraint(String),
    /// The diff is inside constraints but git could not apply it.
    /// The working tree is untouched.
    Failed(String),
}

/// Validate an `ok` proposal and apply it to the worktree.
#[instrument(skip_all, fields(batch_id = %batch.id))]
pub fn check_and_apply(
    worktree: &Path,
    batch: &Batch,
    scope: &ScopeMatcher,
    proposal: &PatchProposal,
    config: &RunConfig,
) -> Result<ApplyOutcome> {
    if proposal.touched_files.is_empty() {
        return Ok(ApplyOutcome::Constraint(
            "proposal lists no touched files".to_string(),
        ));
    }

    let out_of_scope = scope.violations(proposal.touched_files.iter().map(String::as_str));
    if !out_of_scope.is_empty() {
        return Ok(ApplyOutcome::Constraint(format!(
            "files out of scope: {}",
            out_of_scope.join(", ")
        )));
    }

    let stats = match diffstat::parse(&proposal.patch_unified_diff) {
        Ok(stats) => stats,
        Err(err) => {
            return Ok(ApplyOutcome::Constraint(format!(
                "diff does not parse: {err}"
            )));
        }
    };

    if stats.has_binary && !config.allow_binary_patches {
        return Ok(ApplyOutcome::Constraint(
            "binary hunks are not allowed".to_string(),
        ));
    }

    if stats.total_changed() > batch.diff_budget_loc {
        return Ok(ApplyOutcome::Constraint(format!(
            "patch exceeds diff budget: {} > {}",
            stats.total_changed(),
            batch.diff_budget_loc
        )));
    }

    // The diff must not smuggle in files beyond what the proposal declares.
    let undeclared: Vec<&String> = stats
        .files
        .iter()
        .filter(|f| !proposal.touched_files.contains(f))
        .collect();
    if !undeclared.is_empty() {
        return Ok(ApplyOutcome::Constraint(format!(
            "diff touches undeclared files: {}",
            undeclared
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let patch_file = write_patch_file(worktree, &batch.id, &proposal.patch_unified_diff)?;
    let git = Git::new(worktree);

    if let Err(err) = git.apply_check(&patch_file) {
        fs::remove_file(&patch_file).ok();
        return Ok(ApplyOutcome::Failed(format!("{err:#}")));
    }

    let applied = git.apply(&patch_file);
    fs::remove_file(&patch_file).ok();
    match applied {
        Ok(()) => {
            info!(
                files = stats.files.len(),
                changed = stats.total_changed(),
                "patch applied"
            );
            Ok(ApplyOutcome::Applied(stats))
        }
        Err(err) => {
            warn!(%err, "apply failed after successful check");
            Ok(ApplyOutcome::Failed(format!("{err:#}")))
        }
    }
}

/// Outcome of a formatting-only batch.
#[derive(Debug)]
pub enum FormatOutcome {
    /// Formatter changed these files; they are staged for checkpointing.
    Changed(Vec<String>),
    /// Formatter ran and had nothing to do.
    Clean,
    /// No formatter configured, or the formatter stepped outside its lane.
    Rejected(String),
}

/// Run the configured formatter for a formatting-only batch.
///
/// Model-authored hunks are never accepted here; all edits come from the
/// formatter command. Out-of-policy changes roll the tree back.
#[instrument(skip_all, fields(batch_id = %batch.id))]
pub fn run_formatter(
    worktree: &Path,
    batch: &Batch,
    scope: &ScopeMatcher,
    config: &RunConfig,
    cancel: &CancelToken,
) -> Result<FormatOutcome> {
    let Some(command) = config.formatter_command.as_deref() else {
        return Ok(FormatOutcome::Rejected(
            "no formatter_command configured".to_string(),
        ));
    };

    debug!(command, "running formatter");
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(worktree);
    let output = run_command_with_timeout(
        cmd,
        None,
        Duration::from_secs(config.command_timeout_secs),
        config.output_limit_bytes,
        cancel,
    )
    .context("run formatter")?;
    if !output.status.success() {
        return Ok(FormatOutcome::Rejected(format!(
            "formatter exited with {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let git = Git::new(worktree);
    let changed: Vec<String> = git
        .status_porcelain()?
        .into_iter()
        .map(|e| e.path)
        .filter(|p| !p.starts_with(STATE_DIR))
        .collect();
    if changed.is_empty() {
        return Ok(FormatOutcome::Clean);
    }

    let offenders: Vec<&String> = changed
        .iter()
        .filter(|path| !scope.is_in_scope(path) || !has_formatter_extension(path, config))
        .collect();
    if !offenders.is_empty() {
        warn!(count = offenders.len(), "formatter touched out-of-policy files, rolling back");
        git.reset_hard("HEAD")?;
        return Ok(FormatOutcome::Rejected(format!(
            "formatter touched out-of-policy files: {}",
            offenders
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    Ok(FormatOutcome::Changed(changed))
}

fn has_formatter_extension(path: &str, config: &RunConfig) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| config.formatter_extensions.iter().any(|allowed| allowed == ext))
        .unwrap_or(false)
}

fn write_patch_file(worktree: &Path, batch_id: &str, diff: &str) -> Result<std::path::PathBuf> {
    let tmp_dir = worktree.join(STATE_DIR).join("tmp");
    fs::create_dir_all(&tmp_dir).with_context(|| format!("create {}", tmp_dir.display()))?;
    let path = tmp_dir.join(format!("{batch_id}.diff"));
    let mut contents = diff.to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{OperationKind, ProposalStatus, VerifierLevel};

    fn init_worktree(root: &Path) {
        let git = Git::new(root);
        git.init().expect("init");
        fs::create_dir_all(root.join("src")).expect("mkdir");
        fs::write(root.join("src/a.py"), "def foo():\n    return 1\n").expect("write");
        git.commit_all("baseline").expect("commit");
    }

    fn rename_batch() -> Batch {
        Batch {
            id: "batch-001".to_string(),
            goal: "rename foo to bar".to_string(),
            scope: vec!["src/**".to_string()],
            operations: vec![OperationKind::Rename],
            diff_budget_loc: 50,
            risk: 20,
            verifier: VerifierLevel::Fast,
            critical: false,
            notes: String::new(),
        }
    }

    fn rename_proposal() -> PatchProposal {
        PatchProposal {
            status: ProposalStatus::Ok,
            rationale: "rename".to_string(),
            risk_notes: Vec::new(),
            patch_unified_diff: "\
--- a/src/a.py
+++ b/src/a.py
@@ -1,2 +1,2 @@
-def foo():
+def bar():
     return 1
"
            .to_string(),
            touched_files: vec!["src/a.py".to_string()],
            expected_verifier_commands: Vec::new(),
            follow_ups: Vec::new(),
        }
    }

    fn test_config() -> RunConfig {
        let mut cfg = RunConfig::default();
        cfg.fast_verifier = vec!["echo ok".to_string()];
        cfg
    }

    #[test]
    fn valid_patch_applies() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_worktree(temp.path());
        let batch = rename_batch();
        let scope = ScopeMatcher::new(&batch.scope, &[]).expect("scope");

        let outcome = check_and_apply(
            temp.path(),
            &batch,
            &scope,
            &rename_proposal(),
            &test_config(),
        )
        .expect("apply");

        match outcome {
            ApplyOutcome::Applied(stats) => {
                assert_eq!(stats.total_changed(), 2);
                let content = fs::read_to_string(temp.path().join("src/a.py")).expect("read");
                assert!(content.contains("def bar()"));
            }
            other => panic!("expected Applied, got {other:?}"),
        }
    }

    #[test]
    fn out_of_scope_file_is_rejected_before_touching_the_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_worktree(temp.path());
        let batch = rename_batch();
        let scope = ScopeMatcher::new(&batch.scope, &[]).expect("scope");

        let mut proposal = rename_proposal();
        proposal.touched_files.push("README.md".to_string());

        let outcome = check_and_apply(temp.path(), &batch, &scope, &proposal, &test_config())
            .expect("check");
        match outcome {
            ApplyOutcome::Constraint(reason) => assert!(reason.contains("out of scope")),
            other => panic!("expected Rejected, got {other:?}"),
        }
        let content = fs::read_to_string(temp.path().join("src/a.py")).expect("read");
        assert!(content.contains("def foo()"));
    }

    #[test]
    fn oversize_patch_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_worktree(temp.path());
        let mut batch = rename_batch();
        batch.diff_budget_loc = 1;
        let scope = ScopeMatcher::new(&batch.scope, &[]).expect("scope");

        let outcome = check_and_apply(
            temp.path(),
            &batch,
            &scope,
            &rename_proposal(),
            &test_config(),
        )
        .expect("check");
        match outcome {
            ApplyOutcome::Constraint(reason) => assert!(reason.contains("diff budget")),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn binary_hunks_are_rejected_unless_allowed() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_worktree(temp.path());
        let batch = rename_batch();
        let scope = ScopeMatcher::new(&batch.scope, &[]).expect("scope");

        let mut proposal = rename_proposal();
        proposal.patch_unified_diff = "\
diff --git a/src/a.bin b/src/a.bin
Binary files a/src/a.bin and b/src/a.bin differ
--- a/src/a.bin
+++ b/src/a.bin
"
        .to_string();
        proposal.touched_files = vec!["src/a.bin".to_string()];

        let outcome = check_and_apply(temp.path(), &batch, &scope, &proposal, &test_config())
            .expect("check");
        match outcome {
            ApplyOutcome::Constraint(reason) => assert!(reason.contains("binary")),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn undeclared_diff_files_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_worktree(temp.path());
        let batch = rename_batch();
        let scope = ScopeMatcher::new(&batch.scope, &[]).expect("scope");

        let mut proposal = rename_proposal();
        // Diff edits src/a.py but the proposal only declares src/b.py.
        proposal.touched_files = vec!["src/b.py".to_string()];

        let outcome = check_and_apply(temp.path(), &batch, &scope, &proposal, &test_config())
            .expect("check");
        match outcome {
            ApplyOutcome::Constraint(reason) => assert!(reason.contains("undeclared")),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_patch_fails_the_dry_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_worktree(temp.path());
        let batch = rename_batch();
        let scope = ScopeMatcher::new(&batch.scope, &[]).expect("scope");

        let mut proposal = rename_proposal();
        proposal.patch_unified_diff = "\
--- a/src/a.py
+++ b/src/a.py
@@ -1,2 +1,2 @@
-def something_else():
+def bar():
     return 1
"
        .to_string();

        let outcome = check_and_apply(temp.path(), &batch, &scope, &proposal, &test_config())
            .expect("check");
        assert!(matches!(outcome, ApplyOutcome::Failed(_)));
        let content = fs::read_to_string(temp.path().join("src/a.py")).expect("read");
        assert!(content.contains("def foo()"));
    }

    #[test]
    fn formatter_changes_in_policy_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_worktree(temp.path());
        let mut batch = rename_batch();
        batch.operations = vec![OperationKind::FormatOnly];
        let scope = ScopeMatcher::new(&batch.scope, &[]).expect("scope");

        let mut cfg = test_config();
        cfg.formatter_command =
            Some("printf 'def foo():\\n    return 1\\n\\n' > src/a.py".to_string());

        let outcome =
            run_formatter(temp.path(), &batch, &scope, &cfg, &CancelToken::new()).expect("format");
        match outcome {
            FormatOutcome::Changed(files) => assert_eq!(files, vec!["src/a.py".to_string()]),
            other => panic!("expected Changed, got {other:?}"),
        }
    }

    #[test]
    fn formatter_touching_out_of_policy_file_rolls_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_worktree(temp.path());
        fs::write(temp.path().join("notes.md"), "# notes\n").expect("write");
        Git::new(temp.path()).commit_all("add notes").expect("commit");

        let mut batch = rename_batch();
        batch.operations = vec![OperationKind::FormatOnly];
        batch.scope = vec!["**/*".to_string()];
        let scope = ScopeMatcher::new(&batch.scope, &[]).expect("scope");

        let mut cfg = test_config();
        cfg.formatter_command = Some("echo extra >> notes.md".to_string());

        let outcome =
            run_formatter(temp.path(), &batch, &scope, &cfg, &CancelToken::new()).expect("format");
        match outcome {
            FormatOutcome::Rejected(reason) => assert!(reason.contains("notes.md")),
            other => panic!("expected Rejected, got {other:?}"),
        }
        // Rolled back.
        assert_eq!(
            fs::read_to_string(temp.path().join("notes.md")).expect("read"),
            "# notes\n"
        );
    }

    #[test]
    fn formatter_missing_command_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_worktree(temp.path());
        let mut batch = rename_batch();
        batch.operations = vec![OperationKind::FormatOnly];
        let scope = ScopeMatcher::new(&batch.scope, &[]).expect("scope");

        let outcome = run_formatter(
            temp.path(),
            &batch,
            &scope,
            &test_config(),
            &CancelToken::new(),
        )
        .expect("format");
        assert!(matches!(outcome, FormatOutcome::Rejected(_)));
    }
}
