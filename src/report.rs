//! Final run report: one line per batch, totals, and recovery guidance.
//!
//! Built entirely from the plan and the ledger so the report always reflects
//! what was durably recorded, not what the orchestrator believes happened.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::{BatchOutcome, RefactorPlan, RunStatus};
use crate::io::ledger::Ledger;

pub const REPORT_FILE: &str = "report.json";

/// Final state of one planned batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub id: String,
    pub goal: String,
    /// None when the run ended before this batch started.
    pub outcome: Option<BatchOutcome>,
    pub attempts: u32,
    pub checkpoint: Option<String>,
    pub verifier_summary: Option<String>,
    pub error: Option<String>,
}

/// Everything the user needs to accept or roll back a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub repo_path: String,
    pub worktree_path: String,
    pub backup_dir: Option<String>,
    pub status: RunStatus,
    pub started_at: String,
    pub ended_at: String,
    pub batches: Vec<BatchReport>,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub files_touched: Vec<String>,
    /// Where captured verifier output lives.
    pub verification_dir: String,
    /// Recommended next step after an abort.
    pub recovery: Option<String>,
}

impl RunReport {
    /// Assemble the report from the frozen plan and the ledger.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        run_id: &str,
        repo_path: &Path,
        worktree_path: &Path,
        backup_dir: Option<&Path>,
        verification_dir: &Path,
        plan: &RefactorPlan,
        ledger: &Ledger,
        status: RunStatus,
        started_at: &str,
        ended_at: &str,
    ) -> Self {
        let mut batches = Vec::new();
        for batch in &plan.batches {
            let entries: Vec<_> = ledger
                .entries()
                .iter()
                .filter(|e| e.run_id == run_id && e.batch_id == batch.id)
                .collect();
            let last = entries.last();
            batches.push(BatchReport {
                id: batch.id.clone(),
                goal: batch.goal.clone(),
                outcome: last.map(|e| e.outcome),
                attempts: entries.iter().map(|e| e.attempt).max().unwrap_or(0),
                checkpoint: last.and_then(|e| e.checkpoint.clone()),
                verifier_summary: last.and_then(|e| e.verifier_summary.clone()),
                error: last.and_then(|e| e.error.clone()),
            });
        }

        let summary = ledger.summarize(run_id);
        let recovery = match status {
            RunStatus::Aborted => Some(match ledger.last_checkpoint() {
                Some(checkpoint) => format!(
                    "Partial work is checkpointed at {checkpoint} in the worktree. Accept it \
                     from there, or run `recast rollback {} --backup-id {run_id}` to restore \
                     the baseline.",
                    repo_path.display()
                ),
                None => format!(
                    "No batch was applied. Run `recast rollback {} --backup-id {run_id}` if \
                     the repository needs restoring.",
                    repo_path.display()
                ),
            }),
            _ => None,
        };

        Self {
            run_id: run_id.to_string(),
            repo_path: repo_path.display().to_string(),
            worktree_path: worktree_path.display().to_string(),
            backup_dir: backup_dir.map(|p| p.display().to_string()),
            status,
            started_at: started_at.to_string(),
            ended_at: ended_at.to_string(),
            batches,
            lines_added: summary.lines_added,
            lines_removed: summary.lines_removed,
            files_touched: summary.files_touched,
            verification_dir: verification_dir.display().to_string(),
            recovery,
        }
    }

    /// Plain-text rendering for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("=== recast run {} ===\n", self.run_id));
        out.push_str(&format!("repository: {}\n", self.repo_path));
        out.push_str(&format!("worktree:   {}\n", self.worktree_path));
        if let Some(backup) = &self.backup_dir {
            out.push_str(&format!("backup:     {backup}\n"));
        }
        out.push_str(&format!("status:     {:?}\n\n", self.status));

        for batch in &self.batches {
            let outcome = batch
                .outcome
                .map(|o| format!("{o:?}"))
                .unwrap_or_else(|| "NotRun".to_string());
            out.push_str(&format!("  [{}] {} -> {}", batch.id, batch.goal, outcome));
            if batch.attempts > 1 {
                out.push_str(&format!(" (attempt {})", batch.attempts));
            }
            if let Some(checkpoint) = &batch.checkpoint {
                out.push_str(&format!(" @ {}", &checkpoint[..checkpoint.len().min(12)]));
            }
            out.push('\n');
            if let Some(error) = &batch.error {
                out.push_str(&format!("      error: {error}\n"));
            }
        }

        out.push_str(&format!(
            "\nchanges: +{} -{} lines across {} files\n",
            self.lines_added,
            self.lines_removed,
            self.files_touched.len()
        ));
        out.push_str(&format!("verifier output: {}\n", self.verification_dir));
        if let Some(recovery) = &self.recovery {
            out.push_str(&format!("\nrecovery: {recovery}\n"));
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut buf = serde_json::to_string_pretty(self).context("serialize report")?;
        buf.push('\n');
        fs::write(path, buf).with_context(|| format!("write {}", path.display()))
    }
}
