//! Run configuration stored at the target repo root (`.recast.toml`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CONFIG_FILE: &str = ".recast.toml";

/// Main run configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Glob patterns subtracted from every batch scope.
    pub scope_excludes: Vec<String>,

    /// Ordered command list for the fast verifier level (runs per batch).
    pub fast_verifier: Vec<String>,
    /// Ordered command list for the full verifier level (baseline, cadence, final).
    pub full_verifier: Vec<String>,

    /// Hard cap on plan length.
    pub max_batches: usize,
    /// Default per-batch added+removed line budget.
    pub diff_budget_loc: usize,
    /// Max re-attempts after an apply or verify failure.
    pub retry_per_batch: u32,
    /// Run the full verifier every N applied batches.
    pub run_full_verifier_every: usize,

    /// Disables contract-snapshot failure on public API changes.
    pub allow_public_api_changes: bool,
    /// Accept patches containing binary hunks.
    pub allow_binary_patches: bool,
    /// Emit a formatting-only pass at the head of the plan.
    pub allow_formatting_only: bool,
    /// Hand the heuristic plan to the agent for refinement.
    pub use_agent_planner: bool,

    /// Formatter invocation for formatting-only batches (shell command).
    pub formatter_command: Option<String>,
    /// File extensions the formatter is allowed to touch.
    pub formatter_extensions: Vec<String>,

    /// Per verifier-command wall-clock budget in seconds.
    pub command_timeout_secs: u64,
    /// Per agent-invocation wall-clock budget in seconds.
    pub agent_timeout_secs: u64,
    /// Optional ceiling for the whole run; exceeding it starts a graceful
    /// cancellation.
    pub run_timeout_secs: Option<u64>,
    /// Truncate captured child output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Total character budget for one context pack.
    pub max_context_chars: usize,
    /// Total excerpt-line budget for one context pack.
    pub max_excerpt_lines: usize,
    /// Ledger entries included in the context pack tail.
    pub max_ledger_entries: usize,

    pub claude: ClaudeConfig,
}

/// Configuration for the external agent CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClaudeConfig {
    /// Path to the agent binary.
    pub binary: String,
    /// Tool allowlist passed through (`--allowedTools`).
    pub allowed_tools: String,
    /// Tools to expose (`--tools`).
    pub tools: String,
    /// Per-call turn cap for the patcher role.
    pub max_turns_patcher: u32,
    /// Per-call turn cap for the planner role.
    pub max_turns_planner: u32,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            allowed_tools: "Read,Grep,Glob".to_string(),
            tools: "Read,Grep,Glob".to_string(),
            max_turns_patcher: 50,
            max_turns_planner: 50,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scope_excludes: vec![
                "**/dist/**".to_string(),
                "**/build/**".to_string(),
                "**/target/**".to_string(),
                "**/node_modules/**".to_string(),
                "**/__pycache__/**".to_string(),
                "**/.venv/**".to_string(),
                "**/.git/**".to_string(),
                ".recast/**".to_string(),
            ],
            fast_verifier: Vec::new(),
            full_verifier: Vec::new(),
            max_batches: 200,
            diff_budget_loc: 300,
            retry_per_batch: 2,
            run_full_verifier_every: 5,
            allow_public_api_changes: false,
            allow_binary_patches: false,
            allow_formatting_only: true,
            use_agent_planner: true,
            formatter_command: None,
            formatter_extensions: vec![
                "rs".to_string(),
                "py".to_string(),
                "js".to_string(),
                "ts".to_string(),
                "go".to_string(),
            ],
            command_timeout_secs: 300,
            agent_timeout_secs: 600,
            run_timeout_secs: None,
            output_limit_bytes: 100_000,
            max_context_chars: 40_000,
            max_excerpt_lines: 600,
            max_ledger_entries: 10,
            claude: ClaudeConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fast_verifier.is_empty() {
            return Err(anyhow!(
                "fast_verifier must not be empty (set it in {CONFIG_FILE} or let detection fill it)"
            ));
        }
        if self.max_batches == 0 {
            return Err(anyhow!("max_batches must be > 0"));
        }
        if self.diff_budget_loc == 0 {
            return Err(anyhow!("diff_budget_loc must be > 0"));
        }
        if self.run_full_verifier_every == 0 {
            return Err(anyhow!("run_full_verifier_every must be > 0"));
        }
        if self.command_timeout_secs == 0 || self.agent_timeout_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(anyhow!("run_timeout_secs must be > 0 when set"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_context_chars == 0 || self.max_excerpt_lines == 0 {
            return Err(anyhow!("context budgets must be > 0"));
        }
        if self.claude.binary.trim().is_empty() {
            return Err(anyhow!("claude.binary must not be empty"));
        }
        Ok(())
    }

    /// Load config from `<repo>/.recast.toml`.
    ///
    /// If the file is missing, returns defaults with verifier commands
    /// detected from the project layout.
    pub fn load(repo: &Path) -> Result<Self> {
        let path = repo.join(CONFIG_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "no config file, detecting verifiers");
            let mut cfg = Self::default();
            cfg.detect_verifiers(repo);
            cfg.validate()?;
            return Ok(cfg);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let mut cfg: Self =
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        if cfg.fast_verifier.is_empty() {
            cfg.detect_verifiers(repo);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Atomically write config to `<repo>/.recast.toml` (temp file + rename).
    pub fn write(&self, repo: &Path) -> Result<()> {
        self.validate()?;
        let path = repo.join(CONFIG_FILE);
        let mut buf = toml::to_string_pretty(self).context("serialize config toml")?;
        buf.push('\n');
        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, &buf)
            .with_context(|| format!("write temp config {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("replace config {}", path.display()))?;
        Ok(())
    }

    /// Fill empty verifier lists from the project layout.
    pub fn detect_verifiers(&mut self, repo: &Path) {
        let (fast, full) = detect_commands(repo);
        if self.fast_verifier.is_empty() {
            self.fast_verifier = fast;
        }
        if self.full_verifier.is_empty() {
            self.full_verifier = full;
        }
    }
}

/// Auto-detect verification commands based on project files.
fn detect_commands(repo: &Path) -> (Vec<String>, Vec<String>) {
    if repo.join("Cargo.toml").exists() {
        return (
            vec!["cargo test".to_string()],
            vec![
                "cargo test".to_string(),
                "cargo clippy -- -D warnings".to_string(),
            ],
        );
    }
    if repo.join("package.json").exists() {
        return (
            vec!["npm test".to_string()],
            vec!["npm test".to_string(), "npm run lint".to_string()],
        );
    }
    if repo.join("pyproject.toml").exists() || repo.join("setup.py").exists() {
        return (
            vec!["pytest".to_string()],
            vec!["pytest".to_string(), "ruff check .".to_string()],
        );
    }
    if repo.join("go.mod").exists() {
        return (
            vec!["go test ./...".to_string()],
            vec!["go test ./...".to_string(), "go vet ./...".to_string()],
        );
    }
    let fallback = vec!["echo 'no test command detected'".to_string()];
    (fallback.clone(), fallback)
}
