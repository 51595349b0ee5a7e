//! The batch state machine driving a full refactoring run.
//!
//! Single-writer: one batch is active at a time, one child process at a time.
//! Per batch the happy path walks `Pending -> ContextBuilt -> AgentCalled ->
//! Proposed -> Applied -> Verified -> Checkpointed`; side exits are `Nooped`,
//! `Blocked`, `ApplyFailed`, and `VerifyFailed`. The ledger append for an
//! event is flushed before the event is acknowledged anywhere else.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::index::{ApiSnapshot, CodeIndex};
use crate::core::scope::ScopeMatcher;
use crate::core::types::{
    Batch, BatchOutcome, BatchState, ProposalStatus, RefactorPlan, RunStatus, VerifierLevel,
};
use crate::exit_codes;
use crate::io::agent::Agent;
use crate::io::backup::{BackupArtifact, BackupManager};
use crate::io::cancel::CancelToken;
use crate::io::config::RunConfig;
use crate::io::context::ContextPackBuilder;
use crate::io::git::Git;
use crate::io::ledger::{Ledger, LedgerEntry};
use crate::io::paths::{CacheLayout, STATE_DIR};
use crate::io::repo::RepoManager;
use crate::io::verifier::Verifier;
use crate::patch::{self, ApplyOutcome, FormatOutcome};
use crate::planner::{PLAN_FILE, Planner, save_plan};
use crate::report::{REPORT_FILE, RunReport};

pub const LEDGER_FILE: &str = "ledger.jsonl";
pub const RUN_FILE: &str = "run.json";
pub const API_SNAPSHOT_FILE: &str = "api_snapshot.json";
pub const RISK_REGISTER_FILE: &str = "risk_register.json";

/// Index artifacts copied from the original repo into the worktree state dir.
const INDEX_ARTIFACTS: [&str; 3] = ["symbols.json", "deps.json", "ARCHITECTURE.md"];

/// Run-scoped context threaded through every component. There is no global
/// mutable state; everything a component needs arrives through this.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub repo_path: PathBuf,
    pub config: RunConfig,
    pub layout: CacheLayout,
    pub cancel: CancelToken,
}

/// Flags for one `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub skip_backup: bool,
    pub dry_run: bool,
    pub keep_worktree: bool,
}

/// Terminal result of a run.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub exit_code: i32,
    pub report: Option<RunReport>,
}

/// Durable record of one run, written at start and finalized at the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub repo_path: String,
    pub worktree_path: String,
    pub baseline: String,
    pub backup_dir: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: RunStatus,
}

impl RunRecord {
    fn save(&self, path: &Path) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(self).context("serialize run record")?;
        buf.push('\n');
        fs::write(path, buf).with_context(|| format!("write {}", path.display()))
    }
}

/// Execute the full pipeline: backup, worktree, baseline, plan, confirm,
/// batches, final verification, report.
///
/// `confirm` is consulted exactly once, after the plan is frozen and before
/// the first batch; everything after that is autonomous.
#[instrument(skip_all, fields(run_id = %ctx.run_id))]
pub fn execute_run<A: Agent>(
    ctx: &RunContext,
    agent: &A,
    options: &RunOptions,
    confirm: impl FnOnce(&RefactorPlan) -> Result<bool>,
) -> Result<RunOutcome> {
    let started_at = Utc::now().to_rfc3339();
    let deadline = ctx
        .config
        .run_timeout_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    let mut repo = RepoManager::new(&ctx.repo_path, &ctx.run_id);
    repo.validate()?;

    let backup = if options.skip_backup {
        warn!("backup skipped on request");
        None
    } else {
        Some(
            BackupManager::new(&ctx.layout, &ctx.repo_path, &ctx.run_id)
                .snapshot()
                .context("create backup")?,
        )
    };

    let worktree = repo.prepare(&ctx.layout)?;
    let state_dir = worktree.join(STATE_DIR);
    copy_index_artifacts(&ctx.repo_path, &state_dir)?;
    let mut ledger = Ledger::open(state_dir.join(LEDGER_FILE))?;

    let baseline = repo.baseline()?.to_string();
    let mut record = RunRecord {
        run_id: ctx.run_id.clone(),
        repo_path: ctx.repo_path.display().to_string(),
        worktree_path: worktree.display().to_string(),
        baseline: baseline.clone(),
        backup_dir: backup.as_ref().map(|b| b.dir.display().to_string()),
        started_at: started_at.clone(),
        ended_at: None,
        status: RunStatus::Running,
    };
    record.save(&state_dir.join(RUN_FILE))?;

    let verifier = Verifier::new(&worktree, &state_dir, &ctx.config, ctx.cancel.clone());

    // The baseline must pass on the untouched worktree before any user
    // confirmation; a broken baseline means verifier failures later would be
    // meaningless.
    info!("running baseline verification");
    let baseline_result = verifier.run_baseline()?;
    if baseline_result.cancelled() || ctx.cancel.is_cancelled() {
        ledger.append(LedgerEntry::new(
            &ctx.run_id,
            "baseline",
            1,
            BatchOutcome::Cancelled,
        ))?;
        repo.teardown(options.keep_worktree)?;
        return Ok(RunOutcome {
            status: RunStatus::Aborted,
            exit_code: exit_codes::CANCELLED,
            report: None,
        });
    }
    if !baseline_result.passed() {
        warn!(summary = %baseline_result.summary(), "baseline verification failed");
        repo.teardown(options.keep_worktree)?;
        return Ok(RunOutcome {
            status: RunStatus::Aborted,
            exit_code: exit_codes::BASELINE_FAILED,
            report: None,
        });
    }

    let index = CodeIndex::load(&state_dir)?;
    let api_before = index.api_surface();
    write_api_snapshot(&state_dir, &api_before)?;

    let planner = Planner::new(&ctx.repo_path, &ctx.config, &index);
    let draft = planner.draft();
    let plan = {
        let builder = ContextPackBuilder::new(&worktree, &ctx.config, &index, &ledger);
        planner.refine(draft, agent, &builder)
    };
    save_plan(&plan, &state_dir.join(PLAN_FILE))?;
    write_risk_register(&state_dir, &plan)?;

    if options.dry_run {
        info!("dry run: plan saved, no batches executed");
        repo.teardown(options.keep_worktree)?;
        return Ok(RunOutcome {
            status: RunStatus::Completed,
            exit_code: exit_codes::OK,
            report: None,
        });
    }

    if !confirm(&plan)? {
        info!("user declined the plan");
        repo.teardown(options.keep_worktree)?;
        return Ok(RunOutcome {
            status: RunStatus::Aborted,
            exit_code: exit_codes::OK,
            report: None,
        });
    }

    let mut engine = Engine {
        ctx,
        repo,
        verifier,
        ledger,
        index,
        api_before,
        worktree: worktree.clone(),
        state_dir: state_dir.clone(),
        baseline,
        last_checkpoint: None,
        applied_count: 0,
        deadline,
    };

    let (status, exit_code) = engine.run_batches(agent, &plan)?;

    let ended_at = Utc::now().to_rfc3339();
    let report = RunReport::build(
        &ctx.run_id,
        &ctx.repo_path,
        &worktree,
        backup.as_ref().map(|b: &BackupArtifact| b.dir.as_path()),
        engine.verifier.results_dir(),
        &plan,
        &engine.ledger,
        status,
        &started_at,
        &ended_at,
    );
    report.save(&state_dir.join(REPORT_FILE))?;

    record.status = status;
    record.ended_at = Some(ended_at);
    record.save(&state_dir.join(RUN_FILE))?;

    // The worktree stays on disk: AwaitingUser needs it for promotion and an
    // aborted run keeps its checkpoints for recovery.
    engine.repo.teardown(true)?;

    Ok(RunOutcome {
        status,
        exit_code,
        report: Some(report),
    })
}

/// Mutable run state while batches execute.
struct Engine<'a> {
    ctx: &'a RunContext,
    repo: RepoManager,
    verifier: Verifier,
    ledger: Ledger,
    index: CodeIndex,
    api_before: ApiSnapshot,
    worktree: PathBuf,
    state_dir: PathBuf,
    baseline: String,
    last_checkpoint: Option<String>,
    applied_count: usize,
    deadline: Option<Instant>,
}

impl Engine<'_> {
    fn reset_point(&self) -> String {
        self.last_checkpoint
            .clone()
            .unwrap_or_else(|| self.baseline.clone())
    }

    fn run_batches<A: Agent>(
        &mut self,
        agent: &A,
        plan: &RefactorPlan,
    ) -> Result<(RunStatus, i32)> {
        for batch in &plan.batches {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    warn!("run ceiling exceeded, cancelling gracefully");
                    self.ctx.cancel.cancel();
                }
            }
            if self.ctx.cancel.is_cancelled() {
                return self.cancel_run(&batch.id);
            }
            self.repo.ensure_clean_for_batch()?;

            let outcome = self.run_batch(agent, batch)?;
            match outcome {
                BatchOutcome::Applied => {
                    self.applied_count += 1;
                    if self.applied_count % self.ctx.config.run_full_verifier_every == 0 {
                        let label = format!("cadence-{}", self.applied_count);
                        let result = self.verifier.run_level(VerifierLevel::Full, &label)?;
                        if result.cancelled() || self.ctx.cancel.is_cancelled() {
                            return self.cancel_run(&batch.id);
                        }
                        if !result.passed() {
                            let mut entry = LedgerEntry::new(
                                &self.ctx.run_id,
                                &batch.id,
                                1,
                                BatchOutcome::VerifyFailed,
                            );
                            entry.verifier_summary = Some(result.summary());
                            entry.error =
                                Some("periodic full verification failed".to_string());
                            self.ledger.append(entry)?;
                            return Ok((RunStatus::Aborted, exit_codes::BATCH_FAILED));
                        }
                    }
                }
                BatchOutcome::Noop => {}
                BatchOutcome::Blocked => {
                    if batch.critical {
                        warn!(batch_id = %batch.id, "critical batch blocked, aborting");
                        return Ok((RunStatus::Aborted, exit_codes::BATCH_FAILED));
                    }
                }
                BatchOutcome::ApplyFailed | BatchOutcome::VerifyFailed => {
                    return Ok((RunStatus::Aborted, exit_codes::BATCH_FAILED));
                }
                BatchOutcome::Cancelled => {
                    return Ok((RunStatus::Aborted, exit_codes::CANCELLED));
                }
                BatchOutcome::RolledBack => unreachable!("rollback is user-initiated"),
            }
        }

        info!("all batches processed, running final full verification");
        let result = self.verifier.run_level(VerifierLevel::Full, "final")?;
        if result.cancelled() || self.ctx.cancel.is_cancelled() {
            return self.cancel_run("final");
        }
        if !result.passed() {
            let mut entry =
                LedgerEntry::new(&self.ctx.run_id, "final", 1, BatchOutcome::VerifyFailed);
            entry.verifier_summary = Some(result.summary());
            entry.error = Some("final full verification failed".to_string());
            self.ledger.append(entry)?;
            return Ok((RunStatus::Aborted, exit_codes::BATCH_FAILED));
        }

        Ok((RunStatus::AwaitingUser, exit_codes::OK))
    }

    /// Cancellation: reset to the last good state, record it, abort.
    fn cancel_run(&mut self, batch_id: &str) -> Result<(RunStatus, i32)> {
        info!(batch_id, "cancelling run");
        let point = self.reset_point();
        self.repo.reset_to(&point)?;
        self.ledger.append(LedgerEntry::new(
            &self.ctx.run_id,
            batch_id,
            1,
            BatchOutcome::Cancelled,
        ))?;
        Ok((RunStatus::Aborted, exit_codes::CANCELLED))
    }

    /// Drive one batch to a terminal outcome, retrying within
    /// `retry_per_batch` on apply and verify failures.
    #[instrument(skip_all, fields(batch_id = %batch.id))]
    fn run_batch<A: Agent>(&mut self, agent: &A, batch: &Batch) -> Result<BatchOutcome> {
        let scope = ScopeMatcher::new(&batch.scope, &self.ctx.config.scope_excludes)?;

        if batch.is_format_only() {
            return self.run_format_batch(batch, &scope);
        }

        let max_attempts = self.ctx.config.retry_per_batch + 1;
        let mut constraints: Vec<String> = Vec::new();

        for attempt in 1..=max_attempts {
            if self.ctx.cancel.is_cancelled() {
                self.repo.reset_to(&self.reset_point())?;
                self.append_simple(batch, attempt, BatchOutcome::Cancelled, None)?;
                return Ok(BatchOutcome::Cancelled);
            }
            let started = Instant::now();

            debug!(attempt, state = ?BatchState::Pending, "building context");
            let pack = {
                let builder = ContextPackBuilder::new(
                    &self.worktree,
                    &self.ctx.config,
                    &self.index,
                    &self.ledger,
                );
                builder.build_patcher_prompt(batch, &scope, &constraints)?
            };

            debug!(attempt, state = ?BatchState::ContextBuilt, "invoking agent");
            let proposal = agent.propose_patch(&pack.prompt)?;
            debug!(attempt, status = ?proposal.status, state = ?BatchState::Proposed, "proposal received");

            match proposal.status {
                ProposalStatus::Noop => {
                    let mut entry = self.entry(batch, attempt, BatchOutcome::Noop, started);
                    entry.error = non_empty(&proposal.rationale);
                    self.ledger.append(entry)?;
                    return Ok(BatchOutcome::Noop);
                }
                ProposalStatus::Blocked => {
                    let mut entry = self.entry(batch, attempt, BatchOutcome::Blocked, started);
                    entry.error = non_empty(&proposal.rationale);
                    self.ledger.append(entry)?;
                    return Ok(BatchOutcome::Blocked);
                }
                ProposalStatus::Ok => {}
            }

            let applied = patch::check_and_apply(
                &self.worktree,
                batch,
                &scope,
                &proposal,
                &self.ctx.config,
            )?;
            let stats = match applied {
                ApplyOutcome::Constraint(reason) => {
                    warn!(attempt, reason = %reason, state = ?BatchState::ApplyFailed, "proposal violates constraints");
                    if attempt == max_attempts {
                        // Persistent non-conformance is the agent's blockage,
                        // not the repo's; the run continues past this batch.
                        let mut entry = self.entry(batch, attempt, BatchOutcome::Blocked, started);
                        entry.error = Some(reason);
                        self.ledger.append(entry)?;
                        return Ok(BatchOutcome::Blocked);
                    }
                    let mut entry = self.entry(batch, attempt, BatchOutcome::ApplyFailed, started);
                    entry.error = Some(reason.clone());
                    self.ledger.append(entry)?;
                    constraints.push(reason);
                    continue;
                }
                ApplyOutcome::Failed(reason) => {
                    warn!(attempt, reason = %reason, state = ?BatchState::ApplyFailed, "patch failed to apply");
                    let mut entry = self.entry(batch, attempt, BatchOutcome::ApplyFailed, started);
                    entry.error = Some(reason.clone());
                    self.ledger.append(entry)?;
                    constraints.push(reason);
                    if attempt == max_attempts {
                        return Ok(BatchOutcome::ApplyFailed);
                    }
                    continue;
                }
                ApplyOutcome::Applied(stats) => stats,
            };
            debug!(attempt, state = ?BatchState::Applied, "patch in working tree");

            let label = format!("{}-attempt{}", batch.id, attempt);
            let verification = self.verifier.run_level(batch.verifier, &label)?;
            if verification.cancelled() || self.ctx.cancel.is_cancelled() {
                self.repo.reset_to(&self.reset_point())?;
                self.append_simple(batch, attempt, BatchOutcome::Cancelled, None)?;
                return Ok(BatchOutcome::Cancelled);
            }

            let mut failure = verification
                .first_failure()
                .map(|cmd| format!("verifier command '{}' exited {}", cmd.command, cmd.exit_code));
            if failure.is_none() && !self.ctx.config.allow_public_api_changes {
                let fresh = CodeIndex::load(&self.state_dir)?;
                let changes = self.api_before.diff(&fresh.api_surface());
                if !changes.is_empty() {
                    failure = Some(format!("public API changed: {}", changes.join("; ")));
                }
            }

            if let Some(reason) = failure {
                warn!(attempt, reason = %reason, state = ?BatchState::VerifyFailed, "verification failed");
                self.repo.reset_to(&self.reset_point())?;
                let mut entry = self.entry(batch, attempt, BatchOutcome::VerifyFailed, started);
                entry.verifier_summary = Some(verification.summary());
                entry.error = Some(reason.clone());
                self.ledger.append(entry)?;
                constraints.push(format!("the previous patch failed verification: {reason}"));
                if attempt == max_attempts {
                    return Ok(BatchOutcome::VerifyFailed);
                }
                continue;
            }
            debug!(attempt, state = ?BatchState::Verified, "verification passed");

            let checkpoint = self.repo.checkpoint_commit(&batch.id, &batch.goal)?;

            // The checkpoint is acknowledged only after this append is
            // flushed and synced.
            let mut entry = self.entry(batch, attempt, BatchOutcome::Applied, started);
            entry.checkpoint = Some(checkpoint.clone());
            entry.verifier_summary = Some(verification.summary());
            entry.touched_files = stats.files.clone();
            entry.lines_added = stats.lines_added;
            entry.lines_removed = stats.lines_removed;
            self.ledger.append(entry)?;

            info!(attempt, checkpoint = %checkpoint, state = ?BatchState::Checkpointed, "batch applied");
            self.last_checkpoint = Some(checkpoint);
            self.refresh_index()?;
            return Ok(BatchOutcome::Applied);
        }

        unreachable!("attempt loop always returns")
    }

    /// Formatting-only batches never consult the agent.
    fn run_format_batch(&mut self, batch: &Batch, scope: &ScopeMatcher) -> Result<BatchOutcome> {
        let started = Instant::now();
        let outcome = patch::run_formatter(
            &self.worktree,
            batch,
            scope,
            &self.ctx.config,
            &self.ctx.cancel,
        )?;
        match outcome {
            FormatOutcome::Clean => {
                let entry = self.entry(batch, 1, BatchOutcome::Noop, started);
                self.ledger.append(entry)?;
                Ok(BatchOutcome::Noop)
            }
            FormatOutcome::Rejected(reason) => {
                let mut entry = self.entry(batch, 1, BatchOutcome::Blocked, started);
                entry.error = Some(reason);
                self.ledger.append(entry)?;
                Ok(BatchOutcome::Blocked)
            }
            FormatOutcome::Changed(files) => {
                let (lines_added, lines_removed) = Git::new(&self.worktree).diff_numstat()?;

                let label = format!("{}-attempt1", batch.id);
                let verification = self.verifier.run_level(batch.verifier, &label)?;
                if verification.cancelled() || self.ctx.cancel.is_cancelled() {
                    self.repo.reset_to(&self.reset_point())?;
                    self.append_simple(batch, 1, BatchOutcome::Cancelled, None)?;
                    return Ok(BatchOutcome::Cancelled);
                }
                if !verification.passed() {
                    self.repo.reset_to(&self.reset_point())?;
                    let mut entry = self.entry(batch, 1, BatchOutcome::VerifyFailed, started);
                    entry.verifier_summary = Some(verification.summary());
                    entry.error = Some("formatting broke verification".to_string());
                    self.ledger.append(entry)?;
                    return Ok(BatchOutcome::VerifyFailed);
                }

                let checkpoint = self.repo.checkpoint_commit(&batch.id, &batch.goal)?;
                let mut entry = self.entry(batch, 1, BatchOutcome::Applied, started);
                entry.checkpoint = Some(checkpoint.clone());
                entry.verifier_summary = Some(verification.summary());
                entry.touched_files = files;
                entry.lines_added = lines_added;
                entry.lines_removed = lines_removed;
                self.ledger.append(entry)?;

                self.last_checkpoint = Some(checkpoint);
                self.refresh_index()?;
                Ok(BatchOutcome::Applied)
            }
        }
    }

    fn entry(
        &self,
        batch: &Batch,
        attempt: u32,
        outcome: BatchOutcome,
        started: Instant,
    ) -> LedgerEntry {
        let mut entry = LedgerEntry::new(&self.ctx.run_id, &batch.id, attempt, outcome);
        entry.duration_ms = duration_ms(started.elapsed());
        entry
    }

    fn append_simple(
        &mut self,
        batch: &Batch,
        attempt: u32,
        outcome: BatchOutcome,
        error: Option<String>,
    ) -> Result<()> {
        let mut entry = LedgerEntry::new(&self.ctx.run_id, &batch.id, attempt, outcome);
        entry.error = error;
        self.ledger.append(entry)
    }

    /// Reload index artifacts after an applied batch so subsequent context
    /// packs and contract checks see current data.
    fn refresh_index(&mut self) -> Result<()> {
        self.index = CodeIndex::load(&self.state_dir)?;
        self.api_before = self.index.api_surface();
        write_api_snapshot(&self.state_dir, &self.api_before)
    }
}

fn copy_index_artifacts(repo: &Path, state_dir: &Path) -> Result<()> {
    let source_dir = repo.join(STATE_DIR);
    if !source_dir.is_dir() {
        return Ok(());
    }
    for name in INDEX_ARTIFACTS {
        let source = source_dir.join(name);
        if source.is_file() {
            fs::copy(&source, state_dir.join(name))
                .with_context(|| format!("copy index artifact {}", source.display()))?;
        }
    }
    Ok(())
}

/// Per-batch risk entry persisted alongside the frozen plan.
#[derive(Debug, Serialize)]
struct RiskEntry<'a> {
    batch_id: &'a str,
    goal: &'a str,
    risk: u8,
    verifier: VerifierLevel,
    critical: bool,
}

fn write_risk_register(state_dir: &Path, plan: &RefactorPlan) -> Result<()> {
    let entries: Vec<RiskEntry<'_>> = plan
        .batches
        .iter()
        .map(|b| RiskEntry {
            batch_id: &b.id,
            goal: &b.goal,
            risk: b.risk,
            verifier: b.verifier,
            critical: b.critical,
        })
        .collect();
    let path = state_dir.join(RISK_REGISTER_FILE);
    let mut buf = serde_json::to_string_pretty(&entries).context("serialize risk register")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))
}

fn write_api_snapshot(state_dir: &Path, snapshot: &ApiSnapshot) -> Result<()> {
    let path = state_dir.join(API_SNAPSHOT_FILE);
    let mut buf = serde_json::to_string_pretty(snapshot).context("serialize api snapshot")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn duration_ms(elapsed: Duration) -> u64 {
    elapsed.as_millis().min(u128::from(u64::MAX)) as u64
}
