//! Driver for the external agent CLI.
//!
//! The [`Agent`] trait decouples orchestration from the actual backend
//! (currently the `claude` CLI in print mode). Tests use scripted agents that
//! return predetermined proposals without spawning processes.
//!
//! Every invocation is stateless: a fresh session id, no continuation flags,
//! prompts and schemas loaded from versioned files. The agent is an untrusted
//! oracle; its runtime is asked to validate output against the schema and the
//! driver validates again locally.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::types::{PatchProposal, PlannerResponse};
use crate::io::cancel::CancelToken;
use crate::io::config::ClaudeConfig;
use crate::io::process::run_command_with_timeout;

const PLANNER_SYSTEM_PROMPT: &str = include_str!("../prompts/planner.system.md");
const PATCHER_SYSTEM_PROMPT: &str = include_str!("../prompts/patcher.system.md");
const PLANNER_SCHEMA: &str = include_str!("../schemas/planner.schema.json");
const PATCHER_SCHEMA: &str = include_str!("../schemas/patcher.schema.json");

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(120);

const STRICT_REMINDER: &str = "REMINDER: your previous response was not a \
single valid JSON object conforming to the provided schema. Respond with \
ONLY that JSON object. No markdown fences, no prose before or after.\n\n";

/// Result of probing the agent binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAvailability {
    Ready { version: String },
    NotInstalled(String),
    NotAuthenticated(String),
}

/// Abstraction over agent backends.
pub trait Agent {
    fn check_available(&self) -> Result<AgentAvailability>;

    /// Refine a draft plan. An `Err` here is treated as "keep the draft".
    fn refine_plan(&self, prompt: &str) -> Result<PlannerResponse>;

    /// Produce exactly one patch proposal for a batch. Transient failures
    /// (bad JSON, schema violation, timeout) surface as a `blocked` proposal
    /// after one retry, never as an `Err`.
    fn propose_patch(&self, prompt: &str) -> Result<PatchProposal>;
}

/// Agent role; selects system prompt, schema, and turn cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentRole {
    Planner,
    Patcher,
}

impl AgentRole {
    fn name(self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Patcher => "patcher",
        }
    }

    fn system_prompt(self) -> &'static str {
        match self {
            AgentRole::Planner => PLANNER_SYSTEM_PROMPT,
            AgentRole::Patcher => PATCHER_SYSTEM_PROMPT,
        }
    }

    fn schema_text(self) -> &'static str {
        match self {
            AgentRole::Planner => PLANNER_SCHEMA,
            AgentRole::Patcher => PATCHER_SCHEMA,
        }
    }
}

/// Failure classification for one invocation.
enum CallFailure {
    /// Retry once with the strict reminder, then give up.
    Transient(String),
    /// Environment problem; retrying cannot help.
    Fatal(anyhow::Error),
}

/// Driver that spawns the `claude` CLI.
#[derive(Debug)]
pub struct ClaudeAgent {
    config: ClaudeConfig,
    workdir: PathBuf,
    prompts_dir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: CancelToken,
}

impl ClaudeAgent {
    /// Build a driver rooted at `workdir` (the worktree). Nothing is written
    /// until the first schema-locked call: the worktree may not exist yet
    /// when the driver is constructed for the availability probe.
    pub fn new(
        config: &ClaudeConfig,
        workdir: &Path,
        state_dir: &Path,
        timeout: Duration,
        output_limit_bytes: usize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config: config.clone(),
            workdir: workdir.to_path_buf(),
            prompts_dir: state_dir.join("prompts"),
            timeout,
            output_limit_bytes,
            cancel,
        }
    }

    /// Materialize the versioned system prompts and schemas into the state
    /// directory (the CLI takes the system prompt by path).
    fn ensure_assets(&self) -> Result<()> {
        fs::create_dir_all(&self.prompts_dir)
            .with_context(|| format!("create {}", self.prompts_dir.display()))?;
        for role in [AgentRole::Planner, AgentRole::Patcher] {
            let prompt_path = self.system_prompt_path(role);
            fs::write(&prompt_path, role.system_prompt())
                .with_context(|| format!("write {}", prompt_path.display()))?;
            let schema_path = self
                .prompts_dir
                .join(format!("{}.schema.json", role.name()));
            fs::write(&schema_path, role.schema_text())
                .with_context(|| format!("write {}", schema_path.display()))?;
        }
        Ok(())
    }

    fn system_prompt_path(&self, role: AgentRole) -> PathBuf {
        self.prompts_dir.join(format!("{}.system.md", role.name()))
    }

    fn max_turns(&self, role: AgentRole) -> u32 {
        match role {
            AgentRole::Planner => self.config.max_turns_planner,
            AgentRole::Patcher => self.config.max_turns_patcher,
        }
    }

    /// One schema-locked invocation: spawn, collect stdout, parse, extract
    /// the structured-output field, validate locally.
    fn invoke_once(&self, role: AgentRole, prompt: &str) -> Result<Value, CallFailure> {
        self.ensure_assets().map_err(CallFailure::Fatal)?;
        let session_id = Uuid::new_v4().to_string();
        let max_turns = self.max_turns(role).to_string();
        let system_prompt = self.system_prompt_path(role);

        debug!(role = role.name(), session_id = %session_id, "invoking agent");
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--json-schema")
            .arg(role.schema_text())
            .arg("--system-prompt-file")
            .arg(&system_prompt)
            .arg("--allowedTools")
            .arg(&self.config.allowed_tools)
            .arg("--tools")
            .arg(&self.config.tools)
            .arg("--max-turns")
            .arg(&max_turns)
            .arg("--session-id")
            .arg(&session_id)
            .current_dir(&self.workdir);

        let output = run_command_with_timeout(
            cmd,
            None,
            self.timeout,
            self.output_limit_bytes,
            &self.cancel,
        )
        .map_err(CallFailure::Fatal)?;

        if output.cancelled {
            return Err(CallFailure::Fatal(anyhow!("agent invocation cancelled")));
        }
        if output.timed_out {
            return Err(CallFailure::Transient(format!(
                "agent timed out after {:?}",
                self.timeout
            )));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CallFailure::Transient(format!(
                "agent exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let envelope: Value = serde_json::from_str(stdout.trim())
            .map_err(|err| CallFailure::Transient(format!("agent output is not JSON: {err}")))?;

        // The CLI wraps the schema-constrained payload in a result envelope;
        // fall back to the whole object when invoked without wrapping.
        let payload = match envelope.get("structured_output") {
            Some(inner) => inner.clone(),
            None => envelope,
        };

        validate_schema(&payload, role.schema_text())
            .map_err(|err| CallFailure::Transient(format!("schema validation failed: {err}")))?;

        Ok(payload)
    }

    /// Invoke with one strict-reminder retry on transient failure.
    fn call_with_retry<T: DeserializeOwned>(
        &self,
        role: AgentRole,
        prompt: &str,
    ) -> Result<Result<T, String>> {
        let mut last_failure = String::new();
        for attempt in 0..2u32 {
            if self.cancel.is_cancelled() {
                bail!("cancelled");
            }
            let effective = if attempt == 0 {
                prompt.to_string()
            } else {
                format!("{STRICT_REMINDER}{prompt}")
            };
            match self.invoke_once(role, &effective) {
                Ok(payload) => match serde_json::from_value::<T>(payload) {
                    Ok(parsed) => return Ok(Ok(parsed)),
                    Err(err) => {
                        warn!(role = role.name(), attempt, %err, "agent payload did not deserialize");
                        last_failure = format!("payload did not deserialize: {err}");
                    }
                },
                Err(CallFailure::Transient(reason)) => {
                    warn!(role = role.name(), attempt, reason = %reason, "transient agent failure");
                    last_failure = reason;
                }
                Err(CallFailure::Fatal(err)) => return Err(err),
            }
        }
        Ok(Err(last_failure))
    }
}

impl Agent for ClaudeAgent {
    #[instrument(skip_all)]
    fn check_available(&self) -> Result<AgentAvailability> {
        let mut version_cmd = Command::new(&self.config.binary);
        version_cmd.arg("-v");
        let probe = match run_command_with_timeout(
            version_cmd,
            None,
            PROBE_TIMEOUT,
            4096,
            &self.cancel,
        ) {
            Ok(output) => output,
            Err(err) => {
                return Ok(AgentAvailability::NotInstalled(format!(
                    "cannot run '{} -v': {err:#}",
                    self.config.binary
                )));
            }
        };
        if !probe.status.success() {
            return Ok(AgentAvailability::NotInstalled(
                String::from_utf8_lossy(&probe.stderr).trim().to_string(),
            ));
        }
        let version = String::from_utf8_lossy(&probe.stdout).trim().to_string();

        // Authentication is only observable by issuing a trivial prompt.
        let mut auth_cmd = Command::new(&self.config.binary);
        auth_cmd
            .arg("-p")
            .arg("Respond with exactly \"OK\" and nothing else.")
            .arg("--output-format")
            .arg("json")
            .arg("--max-turns")
            .arg("1")
            .arg("--session-id")
            .arg(Uuid::new_v4().to_string());
        let auth =
            run_command_with_timeout(auth_cmd, None, AUTH_TIMEOUT, 16_384, &self.cancel)
                .context("run authentication probe")?;
        if !auth.status.success() || !String::from_utf8_lossy(&auth.stdout).contains("OK") {
            return Ok(AgentAvailability::NotAuthenticated(
                String::from_utf8_lossy(&auth.stderr).trim().to_string(),
            ));
        }

        info!(version = %version, "agent ready");
        Ok(AgentAvailability::Ready { version })
    }

    #[instrument(skip_all)]
    fn refine_plan(&self, prompt: &str) -> Result<PlannerResponse> {
        match self.call_with_retry::<PlannerResponse>(AgentRole::Planner, prompt)? {
            Ok(response) => Ok(response),
            Err(reason) => Err(anyhow!("planner agent failed twice: {reason}")),
        }
    }

    #[instrument(skip_all)]
    fn propose_patch(&self, prompt: &str) -> Result<PatchProposal> {
        match self.call_with_retry::<PatchProposal>(AgentRole::Patcher, prompt)? {
            Ok(proposal) => Ok(proposal),
            Err(reason) => {
                warn!(reason = %reason, "patcher failed twice, reporting blocked");
                Ok(PatchProposal::blocked(format!(
                    "agent failed to produce valid output: {reason}"
                )))
            }
        }
    }
}

/// Validate a JSON instance against a JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema_text: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(schema_text).context("parse schema json")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
