//! Shared deterministic types for the refactor pipeline.
//!
//! These types define stable contracts between components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

/// Operation kinds a batch is allowed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    FormatOnly,
    RemoveUnusedImports,
    RemoveDeadCode,
    Rename,
    ExtractFunction,
    SplitModule,
    AddTests,
    RefactorInternal,
    Architecture,
}

/// Verification level required after a batch is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierLevel {
    Fast,
    Full,
}

/// A planned, bounded unit of refactoring work.
///
/// Batches are immutable once the plan is frozen; the orchestrator only ever
/// reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Identifier unique within the run (e.g. `batch-003`).
    pub id: String,
    /// Human-readable goal for the agent.
    pub goal: String,
    /// Glob patterns selecting the files this batch may touch.
    pub scope: Vec<String>,
    /// Operations the agent is allowed to perform.
    pub operations: Vec<OperationKind>,
    /// Maximum added+removed lines for the batch's patch.
    pub diff_budget_loc: usize,
    /// Estimated risk, 0 (trivial) to 100 (architecture-level).
    pub risk: u8,
    /// Verifier level to run after applying.
    pub verifier: VerifierLevel,
    /// A blocked critical batch aborts the whole run.
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub notes: String,
}

impl Batch {
    /// Formatting-only batches bypass the agent: edits must come from the
    /// configured formatter command, never from model-authored hunks.
    pub fn is_format_only(&self) -> bool {
        self.operations == [OperationKind::FormatOnly]
    }
}

/// An ordered refactoring plan, frozen before execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefactorPlan {
    pub batches: Vec<Batch>,
    pub created_at: String,
    pub repo_path: String,
}

impl RefactorPlan {
    pub fn total_budget_loc(&self) -> usize {
        self.batches.iter().map(|b| b.diff_budget_loc).sum()
    }
}

/// Status declared by the agent for a patch proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    /// The proposal carries a patch to validate and apply.
    Ok,
    /// The agent chose not to change anything for this batch.
    Noop,
    /// The agent could not produce a conforming patch.
    Blocked,
}

/// Structured output of one patcher invocation.
///
/// Unknown fields from the agent are ignored; missing required fields fail
/// deserialization and count as a transient agent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchProposal {
    pub status: ProposalStatus,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub risk_notes: Vec<String>,
    #[serde(default)]
    pub patch_unified_diff: String,
    #[serde(default)]
    pub touched_files: Vec<String>,
    #[serde(default)]
    pub expected_verifier_commands: Vec<String>,
    #[serde(default)]
    pub follow_ups: Vec<String>,
}

impl PatchProposal {
    /// A blocked proposal synthesized by the driver when the agent failed to
    /// produce valid output twice.
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            status: ProposalStatus::Blocked,
            rationale: reason.into(),
            risk_notes: Vec::new(),
            patch_unified_diff: String::new(),
            touched_files: Vec::new(),
            expected_verifier_commands: Vec::new(),
            follow_ups: Vec::new(),
        }
    }
}

/// Structured output of one planner invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerResponse {
    pub batches: Vec<Batch>,
    #[serde(default)]
    pub rationale: String,
}

/// Outcome recorded in the ledger for one batch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchOutcome {
    Applied,
    Noop,
    Blocked,
    ApplyFailed,
    VerifyFailed,
    RolledBack,
    Cancelled,
}

/// Position in the per-batch state machine, used for tracing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchState {
    Pending,
    ContextBuilt,
    AgentCalled,
    Proposed,
    Applied,
    Verified,
    Checkpointed,
    Nooped,
    Blocked,
    ApplyFailed,
    VerifyFailed,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
    AwaitingUser,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_kinds_use_kebab_case_on_the_wire() {
        let json = serde_json::to_string(&OperationKind::RemoveDeadCode).expect("serialize");
        assert_eq!(json, "\"remove-dead-code\"");
        let back: OperationKind = serde_json::from_str("\"format-only\"").expect("parse");
        assert_eq!(back, OperationKind::FormatOnly);
    }

    #[test]
    fn proposal_ignores_unknown_fields_and_defaults_optional_ones() {
        let raw = r#"{"status":"noop","rationale":"nothing to do","vendor_extra":42}"#;
        let proposal: PatchProposal = serde_json::from_str(raw).expect("parse");
        assert_eq!(proposal.status, ProposalStatus::Noop);
        assert!(proposal.touched_files.is_empty());
        assert!(proposal.patch_unified_diff.is_empty());
    }

    #[test]
    fn proposal_rejects_missing_status() {
        let raw = r#"{"rationale":"no status"}"#;
        assert!(serde_json::from_str::<PatchProposal>(raw).is_err());
    }

    #[test]
    fn format_only_detection_requires_exactly_one_operation() {
        let mut batch = Batch {
            id: "batch-001".to_string(),
            goal: "format".to_string(),
            scope: vec!["**/*.py".to_string()],
            operations: vec![OperationKind::FormatOnly],
            diff_budget_loc: 100,
            risk: 5,
            verifier: VerifierLevel::Fast,
            critical: false,
            notes: String::new(),
        };
        assert!(batch.is_format_only());
        batch.operations.push(OperationKind::Rename);
        assert!(!batch.is_format_only());
    }
}
