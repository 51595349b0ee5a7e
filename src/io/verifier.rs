//! Verifier runner: executes configured test/lint commands in the worktree.
//!
//! Each command runs as `sh -c` with an independent timeout; stdout/stderr are
//! captured to files under the state directory so the ledger and report can
//! reference them without inlining output.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::VerifierLevel;
use crate::io::cancel::CancelToken;
use crate::io::config::RunConfig;
use crate::io::process::run_command_with_timeout;

/// Result of running a single verifier command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub cancelled: bool,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl CommandResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

/// Result of running one verifier level.
#[derive(Debug, Clone, Serialize)]
pub struct VerifierResult {
    pub level: VerifierLevel,
    pub commands: Vec<CommandResult>,
}

impl VerifierResult {
    pub fn passed(&self) -> bool {
        self.commands.iter().all(CommandResult::passed)
    }

    pub fn cancelled(&self) -> bool {
        self.commands.iter().any(|c| c.cancelled)
    }

    /// One-line summary for the ledger.
    pub fn summary(&self) -> String {
        let passed = self.commands.iter().filter(|c| c.passed()).count();
        let level = match self.level {
            VerifierLevel::Fast => "fast",
            VerifierLevel::Full => "full",
        };
        let status = if self.passed() { "passed" } else { "failed" };
        format!("{level} {status} ({passed}/{} commands)", self.commands.len())
    }

    pub fn first_failure(&self) -> Option<&CommandResult> {
        self.commands.iter().find(|c| !c.passed())
    }
}

/// Runs verifier command lists against one worktree.
#[derive(Debug)]
pub struct Verifier {
    worktree: PathBuf,
    results_dir: PathBuf,
    fast: Vec<String>,
    full: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: CancelToken,
}

impl Verifier {
    pub fn new(worktree: &Path, state_dir: &Path, config: &RunConfig, cancel: CancelToken) -> Self {
        Self {
            worktree: worktree.to_path_buf(),
            results_dir: state_dir.join("verification"),
            fast: config.fast_verifier.clone(),
            full: if config.full_verifier.is_empty() {
                config.fast_verifier.clone()
            } else {
                config.full_verifier.clone()
            },
            timeout: Duration::from_secs(config.command_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            cancel,
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Run the full verifier on the untouched worktree. A failing baseline
    /// aborts the run before any batch executes.
    pub fn run_baseline(&self) -> Result<VerifierResult> {
        self.run_level(VerifierLevel::Full, "baseline")
    }

    /// Run one verifier level. `label` keys the captured output files.
    ///
    /// Fast stops at the first failing command; full always runs the whole
    /// list so the report shows every failure at once.
    #[instrument(skip_all, fields(level = ?level, label))]
    pub fn run_level(&self, level: VerifierLevel, label: &str) -> Result<VerifierResult> {
        let commands = match level {
            VerifierLevel::Fast => &self.fast,
            VerifierLevel::Full => &self.full,
        };
        let stop_on_failure = level == VerifierLevel::Fast;

        let mut results = Vec::new();
        for (idx, command) in commands.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let result = self.run_command(command, label, idx)?;
            let failed = !result.passed();
            results.push(result);
            if failed && stop_on_failure {
                break;
            }
        }

        let result = VerifierResult { level, commands: results };
        if result.passed() {
            debug!(summary = %result.summary(), "verifier level passed");
        } else {
            warn!(summary = %result.summary(), "verifier level failed");
        }
        Ok(result)
    }

    fn run_command(&self, command: &str, label: &str, idx: usize) -> Result<CommandResult> {
        fs::create_dir_all(&self.results_dir)
            .with_context(|| format!("create {}", self.results_dir.display()))?;
        let stdout_path = self.results_dir.join(format!("{label}-{idx}.stdout.log"));
        let stderr_path = self.results_dir.join(format!("{label}-{idx}.stderr.log"));

        info!(command, "running verifier command");
        let start = Instant::now();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&self.worktree);

        let output = run_command_with_timeout(
            cmd,
            None,
            self.timeout,
            self.output_limit_bytes,
            &self.cancel,
        )
        .with_context(|| format!("run verifier command '{command}'"))?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut stdout_text = String::from_utf8_lossy(&output.stdout).to_string();
        stdout_text.push_str(&output.stdout_truncated_notice("verifier"));
        fs::write(&stdout_path, stdout_text)
            .with_context(|| format!("write {}", stdout_path.display()))?;
        let mut stderr_text = String::from_utf8_lossy(&output.stderr).to_string();
        stderr_text.push_str(&output.stderr_truncated_notice("verifier"));
        if output.timed_out {
            stderr_text.push_str(&format!("\n[verifier timed out after {:?}]\n", self.timeout));
        }
        fs::write(&stderr_path, stderr_text)
            .with_context(|| format!("write {}", stderr_path.display()))?;

        Ok(CommandResult {
            command: command.to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration_ms,
            timed_out: output.timed_out,
            cancelled: output.cancelled,
            stdout_path,
            stderr_path,
        })
    }
}
