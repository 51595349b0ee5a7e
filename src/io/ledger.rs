//! Append-only task ledger (JSONL).
//!
//! The ledger is the source of truth for run progress: one structured record
//! per line, flushed and synced before any component acknowledges success.
//! Entries are never rewritten.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::BatchOutcome;

/// A single entry in the task ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub run_id: String,
    pub batch_id: String,
    /// 1-based agent-invocation attempt within the batch.
    pub attempt: u32,
    pub timestamp: String,
    pub outcome: BatchOutcome,
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub verifier_summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub touched_files: Vec<String>,
    #[serde(default)]
    pub lines_added: usize,
    #[serde(default)]
    pub lines_removed: usize,
    #[serde(default)]
    pub duration_ms: u64,
}

impl LedgerEntry {
    pub fn new(run_id: &str, batch_id: &str, attempt: u32, outcome: BatchOutcome) -> Self {
        Self {
            run_id: run_id.to_string(),
            batch_id: batch_id.to_string(),
            attempt,
            timestamp: Utc::now().to_rfc3339(),
            outcome,
            checkpoint: None,
            verifier_summary: None,
            error: None,
            touched_files: Vec::new(),
            lines_added: 0,
            lines_removed: 0,
            duration_ms: 0,
        }
    }
}

/// Aggregate counters for the final report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub applied: usize,
    pub noop: usize,
    pub blocked: usize,
    pub apply_failed: usize,
    pub verify_failed: usize,
    pub cancelled: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub files_touched: Vec<String>,
}

/// Append-only ledger handle.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    /// Open (or create) the ledger at `path`, loading existing entries.
    /// Malformed lines are skipped so a damaged tail never blocks a run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = Vec::new();
        if path.exists() {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<LedgerEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => warn!(%err, "skipping malformed ledger line"),
                }
            }
        }
        debug!(path = %path.display(), loaded = entries.len(), "ledger opened");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Append one entry: serialize, write, flush, fsync. The entry is durable
    /// before this returns; callers acknowledge success only afterwards.
    pub fn append(&mut self, entry: LedgerEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(&entry).context("serialize ledger entry")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append ledger {}", self.path.display()))?;
        file.flush().context("flush ledger")?;
        file.sync_all().context("sync ledger")?;

        debug!(batch_id = %entry.batch_id, outcome = ?entry.outcome, "ledger appended");
        self.entries.push(entry);
        Ok(())
    }

    /// The most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> &[LedgerEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    /// Checkpoint ref of the most recent applied entry, if any.
    pub fn last_checkpoint(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.outcome == BatchOutcome::Applied)
            .and_then(|e| e.checkpoint.as_deref())
    }

    /// Files touched by applied entries, most recent first, deduplicated.
    pub fn recently_touched(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for entry in self.entries.iter().rev() {
            if entry.outcome != BatchOutcome::Applied {
                continue;
            }
            for file in &entry.touched_files {
                if !seen.contains(file) {
                    seen.push(file.clone());
                }
            }
        }
        seen
    }

    /// Aggregate statistics for one run.
    pub fn summarize(&self, run_id: &str) -> LedgerSummary {
        let mut summary = LedgerSummary::default();
        for entry in self.entries.iter().filter(|e| e.run_id == run_id) {
            match entry.outcome {
                BatchOutcome::Applied => {
                    summary.applied += 1;
                    summary.lines_added += entry.lines_added;
                    summary.lines_removed += entry.lines_removed;
                    for file in &entry.touched_files {
                        if !summary.files_touched.contains(file) {
                            summary.files_touched.push(file.clone());
                        }
                    }
                }
                BatchOutcome::Noop => summary.noop += 1,
                BatchOutcome::Blocked => summary.blocked += 1,
                BatchOutcome::ApplyFailed => summary.apply_failed += 1,
                BatchOutcome::VerifyFailed => summary.verify_failed += 1,
                BatchOutcome::Cancelled => summary.cancelled += 1,
                BatchOutcome::RolledBack => {}
            }
        }
        summary.files_touched.sort();
        summary
    }
}
