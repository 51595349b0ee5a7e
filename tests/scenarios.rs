//! End-to-end scenarios driving `execute_run` with scripted agents.
//!
//! Each test builds a real temporary git repository, scripts the agent's
//! proposals, and uses shell commands as verifiers, then asserts on the
//! durable artifacts: checkpoints, the ledger, backups, and the original
//! repository (which must never change).

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;

use recast::core::types::{
    Batch, BatchOutcome, OperationKind, PatchProposal, PlannerResponse, ProposalStatus, RunStatus,
    VerifierLevel,
};
use recast::exit_codes;
use recast::io::agent::{Agent, AgentAvailability};
use recast::io::backup::{find_backup, restore};
use recast::io::cancel::CancelToken;
use recast::io::config::RunConfig;
use recast::io::git::Git;
use recast::io::ledger::{Ledger, LedgerEntry};
use recast::io::paths::{CacheLayout, STATE_DIR};
use recast::orchestrator::{LEDGER_FILE, RunContext, RunOptions, execute_run};

struct TestEnv {
    _temp: tempfile::TempDir,
    repo: PathBuf,
    layout: CacheLayout,
}

fn setup(files: &[(&str, &str)]) -> TestEnv {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path().join("widget");
    fs::create_dir_all(&repo).expect("mkdir repo");
    for (path, contents) in files {
        let full = repo.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).expect("mkdir parent");
        }
        fs::write(&full, contents).expect("write file");
    }
    let git = Git::new(&repo);
    git.init().expect("git init");
    git.commit_all("initial").expect("initial commit");
    let layout = CacheLayout::from_root(temp.path().join("cache"));
    TestEnv {
        _temp: temp,
        repo,
        layout,
    }
}

fn base_config(fast: &[&str], full: &[&str]) -> RunConfig {
    let mut cfg = RunConfig::default();
    cfg.fast_verifier = fast.iter().map(|s| s.to_string()).collect();
    cfg.full_verifier = full.iter().map(|s| s.to_string()).collect();
    cfg.command_timeout_secs = 30;
    cfg
}

fn make_ctx(env: &TestEnv, run_id: &str, config: RunConfig) -> RunContext {
    RunContext {
        run_id: run_id.to_string(),
        repo_path: env.repo.clone(),
        config,
        layout: env.layout.clone(),
        cancel: CancelToken::new(),
    }
}

fn rename_batch(id: &str, path: &str) -> Batch {
    Batch {
        id: id.to_string(),
        goal: format!("rename foo in {path}"),
        scope: vec![path.to_string()],
        operations: vec![OperationKind::Rename],
        diff_budget_loc: 50,
        risk: 20,
        verifier: VerifierLevel::Fast,
        critical: false,
        notes: String::new(),
    }
}

fn ok_proposal(path: &str, diff: &str) -> PatchProposal {
    PatchProposal {
        status: ProposalStatus::Ok,
        rationale: "scripted".to_string(),
        risk_notes: Vec::new(),
        patch_unified_diff: diff.to_string(),
        touched_files: vec![path.to_string()],
        expected_verifier_commands: Vec::new(),
        follow_ups: Vec::new(),
    }
}

fn noop_proposal() -> PatchProposal {
    PatchProposal {
        status: ProposalStatus::Noop,
        rationale: "nothing left to do".to_string(),
        risk_notes: Vec::new(),
        patch_unified_diff: String::new(),
        touched_files: Vec::new(),
        expected_verifier_commands: Vec::new(),
        follow_ups: Vec::new(),
    }
}

fn rename_diff(path: &str, from: &str, to: &str, ret: &str) -> String {
    format!(
        "--- a/{path}\n+++ b/{path}\n@@ -1,2 +1,2 @@\n-def {from}():\n+def {to}():\n     return {ret}\n"
    )
}

/// Agent scripted with a fixed refined plan and a queue of proposals.
struct ScriptedAgent {
    plan: Vec<Batch>,
    proposals: RefCell<VecDeque<PatchProposal>>,
    patch_calls: Cell<u32>,
    cancel_on_first_call: Option<CancelToken>,
}

impl ScriptedAgent {
    fn new(plan: Vec<Batch>, proposals: Vec<PatchProposal>) -> Self {
        Self {
            plan,
            proposals: RefCell::new(proposals.into()),
            patch_calls: Cell::new(0),
            cancel_on_first_call: None,
        }
    }
}

impl Agent for ScriptedAgent {
    fn check_available(&self) -> Result<AgentAvailability> {
        Ok(AgentAvailability::Ready {
            version: "scripted".to_string(),
        })
    }

    fn refine_plan(&self, _prompt: &str) -> Result<PlannerResponse> {
        Ok(PlannerResponse {
            batches: self.plan.clone(),
            rationale: "scripted plan".to_string(),
        })
    }

    fn propose_patch(&self, _prompt: &str) -> Result<PatchProposal> {
        self.patch_calls.set(self.patch_calls.get() + 1);
        if let Some(token) = &self.cancel_on_first_call {
            token.cancel();
        }
        self.proposals
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted agent exhausted"))
    }
}

/// Snapshot of a tree's file contents, excluding git internals and run state.
fn snapshot_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    collect_files(root, root, &mut out);
    out
}

fn collect_files(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
    for entry in fs::read_dir(dir).expect("read dir") {
        let entry = entry.expect("entry");
        let name = entry.file_name();
        let name = name.to_string_lossy().to_string();
        if name == ".git" || name == STATE_DIR {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else {
            let rel = path.strip_prefix(root).expect("relative").to_string_lossy().to_string();
            out.insert(rel, fs::read(&path).expect("read file"));
        }
    }
}

fn checkpoint_messages(worktree: &Path) -> Vec<String> {
    let output = Command::new("git")
        .args(["log", "--format=%s"])
        .current_dir(worktree)
        .output()
        .expect("git log");
    assert!(output.status.success());
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| l.starts_with("checkpoint("))
        .map(|l| l.to_string())
        .collect()
}

fn open_ledger(env: &TestEnv, run_id: &str) -> Ledger {
    let path = env
        .layout
        .worktree_for(run_id)
        .join(STATE_DIR)
        .join(LEDGER_FILE);
    Ledger::open(path).expect("open ledger")
}

const A_PY: &str = "def foo():\n    return 1\n";
const B_PY: &str = "def foo():\n    return 2\n";

/// S1: happy path with two trivial rename batches.
#[test]
fn s1_happy_path_two_batches() {
    let env = setup(&[("a.py", A_PY), ("b.py", B_PY)]);
    let pre = snapshot_tree(&env.repo);

    let agent = ScriptedAgent::new(
        vec![rename_batch("batch-001", "a.py"), rename_batch("batch-002", "b.py")],
        vec![
            ok_proposal("a.py", &rename_diff("a.py", "foo", "bar", "1")),
            ok_proposal("b.py", &rename_diff("b.py", "foo", "bar", "2")),
        ],
    );
    let ctx = make_ctx(&env, "run-s1", base_config(&["echo ok"], &["echo ok"]));

    let outcome =
        execute_run(&ctx, &agent, &RunOptions::default(), |_| Ok(true)).expect("run");
    assert_eq!(outcome.status, RunStatus::AwaitingUser);
    assert_eq!(outcome.exit_code, exit_codes::OK);

    let worktree = env.layout.worktree_for("run-s1");
    let checkpoints = checkpoint_messages(&worktree);
    assert_eq!(checkpoints.len(), 2);
    assert!(checkpoints[0].starts_with("checkpoint(batch-002)"));
    assert!(checkpoints[1].starts_with("checkpoint(batch-001)"));

    let ledger = open_ledger(&env, "run-s1");
    let applied: Vec<&LedgerEntry> = ledger
        .entries()
        .iter()
        .filter(|e| e.outcome == BatchOutcome::Applied)
        .collect();
    assert_eq!(applied.len(), 2);
    // Scope soundness: touched files stay inside each batch's scope.
    assert_eq!(applied[0].touched_files, vec!["a.py".to_string()]);
    assert_eq!(applied[1].touched_files, vec!["b.py".to_string()]);
    assert!(applied.iter().all(|e| e.checkpoint.is_some()));

    // Isolation: the original repository is untouched.
    assert_eq!(snapshot_tree(&env.repo), pre);

    // The worktree carries both renames.
    assert!(fs::read_to_string(worktree.join("a.py"))
        .expect("read")
        .contains("def bar()"));

    let report = outcome.report.expect("report");
    assert_eq!(report.batches.len(), 2);
    assert!(report.recovery.is_none());
}

/// S2: the agent answers noop for the second batch.
#[test]
fn s2_noop_batch_is_recorded_and_skipped() {
    let env = setup(&[("a.py", A_PY), ("b.py", B_PY)]);
    let agent = ScriptedAgent::new(
        vec![rename_batch("batch-001", "a.py"), rename_batch("batch-002", "b.py")],
        vec![
            ok_proposal("a.py", &rename_diff("a.py", "foo", "bar", "1")),
            noop_proposal(),
        ],
    );
    let ctx = make_ctx(&env, "run-s2", base_config(&["echo ok"], &["echo ok"]));

    let outcome =
        execute_run(&ctx, &agent, &RunOptions::default(), |_| Ok(true)).expect("run");
    assert_eq!(outcome.status, RunStatus::AwaitingUser);

    let worktree = env.layout.worktree_for("run-s2");
    assert_eq!(checkpoint_messages(&worktree).len(), 1);

    let ledger = open_ledger(&env, "run-s2");
    let noop: Vec<&LedgerEntry> = ledger
        .entries()
        .iter()
        .filter(|e| e.outcome == BatchOutcome::Noop)
        .collect();
    assert_eq!(noop.len(), 1);
    assert_eq!(noop[0].batch_id, "batch-002");
    // b.py is untouched in the worktree.
    assert_eq!(
        fs::read_to_string(worktree.join("b.py")).expect("read"),
        B_PY
    );
}

/// S3: the first patch fails verification, the second (different) passes.
#[test]
fn s3_verify_failure_then_retry_succeeds() {
    let env = setup(&[("a.py", A_PY)]);
    // The verifier rejects any tree where a.py mentions FAILME.
    let config = base_config(&["! grep -q FAILME a.py"], &["! grep -q FAILME a.py"]);

    let agent = ScriptedAgent::new(
        vec![rename_batch("batch-001", "a.py")],
        vec![
            ok_proposal("a.py", &rename_diff("a.py", "foo", "FAILME", "1")),
            ok_proposal("a.py", &rename_diff("a.py", "foo", "bar", "1")),
        ],
    );
    let ctx = make_ctx(&env, "run-s3", config);

    let outcome =
        execute_run(&ctx, &agent, &RunOptions::default(), |_| Ok(true)).expect("run");
    assert_eq!(outcome.status, RunStatus::AwaitingUser);
    assert_eq!(agent.patch_calls.get(), 2);

    let worktree = env.layout.worktree_for("run-s3");
    assert_eq!(checkpoint_messages(&worktree).len(), 1);
    // The worktree reset between attempts: the failed rename is gone.
    let content = fs::read_to_string(worktree.join("a.py")).expect("read");
    assert!(content.contains("def bar()"));
    assert!(!content.contains("FAILME"));

    let ledger = open_ledger(&env, "run-s3");
    let failed: Vec<&LedgerEntry> = ledger
        .entries()
        .iter()
        .filter(|e| e.outcome == BatchOutcome::VerifyFailed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempt, 1);
    let applied: Vec<&LedgerEntry> = ledger
        .entries()
        .iter()
        .filter(|e| e.outcome == BatchOutcome::Applied)
        .collect();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].attempt, 2);
}

/// S4: the verifier fails every attempt; the run aborts with exit code 4 and
/// the number of agent invocations never exceeds retry_per_batch + 1.
#[test]
fn s4_persistent_verify_failure_aborts() {
    let env = setup(&[("a.py", A_PY)]);
    // Fast always fails; full passes so the baseline gets through.
    let mut config = base_config(&["false"], &["echo ok"]);
    config.retry_per_batch = 2;

    let patch = ok_proposal("a.py", &rename_diff("a.py", "foo", "bar", "1"));
    let agent = ScriptedAgent::new(
        vec![rename_batch("batch-001", "a.py")],
        vec![patch.clone(), patch.clone(), patch],
    );
    let ctx = make_ctx(&env, "run-s4", config);

    let outcome =
        execute_run(&ctx, &agent, &RunOptions::default(), |_| Ok(true)).expect("run");
    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.exit_code, exit_codes::BATCH_FAILED);
    assert_eq!(agent.patch_calls.get(), 3);

    let worktree = env.layout.worktree_for("run-s4");
    assert!(checkpoint_messages(&worktree).is_empty());
    // Worktree sits back at the baseline.
    assert_eq!(
        fs::read_to_string(worktree.join("a.py")).expect("read"),
        A_PY
    );

    let ledger = open_ledger(&env, "run-s4");
    let last = ledger.entries().last().expect("entries");
    assert_eq!(last.outcome, BatchOutcome::VerifyFailed);
    assert_eq!(last.attempt, 3);

    // Backup remains intact for rollback.
    let backup = find_backup(&env.layout, "run-s4").expect("find").expect("backup");
    assert!(backup.bundle.expect("bundle").exists());
    assert!(backup.archive.expect("archive").exists());

    let report = outcome.report.expect("report");
    assert!(report.recovery.expect("recovery").contains("rollback"));
}

/// S5: an out-of-scope patch is rejected, the agent is re-invoked with the
/// constraint, and after exhausting retries the batch ends blocked while the
/// run continues.
#[test]
fn s5_out_of_scope_patch_blocks_batch_but_run_continues() {
    let env = setup(&[("src/a.py", A_PY), ("README.md", "# widget\n")]);
    let mut config = base_config(&["echo ok"], &["echo ok"]);
    config.retry_per_batch = 2;

    let mut out_of_scope = ok_proposal("src/a.py", &rename_diff("src/a.py", "foo", "bar", "1"));
    out_of_scope.touched_files.push("README.md".to_string());

    let batch1 = rename_batch("batch-001", "src/**");
    let batch2 = rename_batch("batch-002", "src/a.py");

    let agent = ScriptedAgent::new(
        vec![batch1, batch2],
        vec![
            out_of_scope.clone(),
            out_of_scope.clone(),
            out_of_scope,
            noop_proposal(),
        ],
    );
    let ctx = make_ctx(&env, "run-s5", config);

    let outcome =
        execute_run(&ctx, &agent, &RunOptions::default(), |_| Ok(true)).expect("run");
    // The blocked batch does not abort the run.
    assert_eq!(outcome.status, RunStatus::AwaitingUser);
    assert_eq!(outcome.exit_code, exit_codes::OK);
    assert_eq!(agent.patch_calls.get(), 4);

    let ledger = open_ledger(&env, "run-s5");
    let blocked: Vec<&LedgerEntry> = ledger
        .entries()
        .iter()
        .filter(|e| e.outcome == BatchOutcome::Blocked)
        .collect();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].batch_id, "batch-001");
    assert!(blocked[0].error.as_deref().expect("error").contains("out of scope"));
    // Two rejected attempts preceded the final blocked entry.
    let rejected = ledger
        .entries()
        .iter()
        .filter(|e| e.outcome == BatchOutcome::ApplyFailed)
        .count();
    assert_eq!(rejected, 2);
    // batch-002 still ran.
    assert!(ledger.entries().iter().any(|e| e.batch_id == "batch-002"));

    let worktree = env.layout.worktree_for("run-s5");
    assert!(checkpoint_messages(&worktree).is_empty());
}

/// S6: rollback restores the original repository byte for byte and appends a
/// rollback event to the run's ledger.
#[test]
fn s6_rollback_restores_pre_run_state() {
    let env = setup(&[("a.py", A_PY), ("b.py", B_PY)]);
    let pre = snapshot_tree(&env.repo);

    let agent = ScriptedAgent::new(
        vec![rename_batch("batch-001", "a.py"), rename_batch("batch-002", "b.py")],
        vec![
            ok_proposal("a.py", &rename_diff("a.py", "foo", "bar", "1")),
            ok_proposal("b.py", &rename_diff("b.py", "foo", "bar", "2")),
        ],
    );
    let ctx = make_ctx(&env, "run-s6", base_config(&["echo ok"], &["echo ok"]));
    let outcome =
        execute_run(&ctx, &agent, &RunOptions::default(), |_| Ok(true)).expect("run");
    assert_eq!(outcome.status, RunStatus::AwaitingUser);

    // Mirror `recast rollback <repo> --backup-id run-s6`.
    let artifact = find_backup(&env.layout, "run-s6").expect("find").expect("backup");
    restore(&artifact, &env.repo).expect("restore");

    assert_eq!(snapshot_tree(&env.repo), pre);
    // The backup artifact survives the restore.
    assert!(artifact.dir.exists());

    let ledger_path = env
        .layout
        .worktree_for("run-s6")
        .join(STATE_DIR)
        .join(LEDGER_FILE);
    let mut ledger = Ledger::open(&ledger_path).expect("open ledger");
    ledger
        .append(LedgerEntry::new("run-s6", "rollback", 1, BatchOutcome::RolledBack))
        .expect("append");
    let reopened = Ledger::open(&ledger_path).expect("reopen");
    assert_eq!(
        reopened.entries().last().expect("entries").outcome,
        BatchOutcome::RolledBack
    );
}

/// Cancellation promptness: once the token flips, no new checkpoint is
/// created and no further agent invocation begins.
#[test]
fn cancellation_resets_and_records_cancelled() {
    let env = setup(&[("a.py", A_PY), ("b.py", B_PY)]);
    let ctx = make_ctx(&env, "run-cancel", base_config(&["echo ok"], &["echo ok"]));

    let mut agent = ScriptedAgent::new(
        vec![rename_batch("batch-001", "a.py"), rename_batch("batch-002", "b.py")],
        vec![
            ok_proposal("a.py", &rename_diff("a.py", "foo", "bar", "1")),
            ok_proposal("b.py", &rename_diff("b.py", "foo", "bar", "2")),
        ],
    );
    // The token flips while the first batch's agent call is in flight.
    agent.cancel_on_first_call = Some(ctx.cancel.clone());

    let outcome =
        execute_run(&ctx, &agent, &RunOptions::default(), |_| Ok(true)).expect("run");
    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.exit_code, exit_codes::CANCELLED);
    assert_eq!(agent.patch_calls.get(), 1);

    let worktree = env.layout.worktree_for("run-cancel");
    assert!(checkpoint_messages(&worktree).is_empty());
    assert_eq!(
        fs::read_to_string(worktree.join("a.py")).expect("read"),
        A_PY
    );

    let ledger = open_ledger(&env, "run-cancel");
    assert!(ledger
        .entries()
        .iter()
        .any(|e| e.outcome == BatchOutcome::Cancelled));
}

/// A blocked critical batch aborts the whole run.
#[test]
fn critical_blocked_batch_aborts() {
    let env = setup(&[("a.py", A_PY)]);
    let mut batch = rename_batch("batch-001", "a.py");
    batch.critical = true;

    let mut blocked = noop_proposal();
    blocked.status = ProposalStatus::Blocked;
    blocked.rationale = "cannot proceed safely".to_string();

    let agent = ScriptedAgent::new(vec![batch], vec![blocked]);
    let ctx = make_ctx(&env, "run-critical", base_config(&["echo ok"], &["echo ok"]));

    let outcome =
        execute_run(&ctx, &agent, &RunOptions::default(), |_| Ok(true)).expect("run");
    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.exit_code, exit_codes::BATCH_FAILED);
}

/// Baseline failure aborts before any confirmation or batch.
#[test]
fn failing_baseline_aborts_with_exit_three() {
    let env = setup(&[("a.py", A_PY)]);
    let config = base_config(&["echo ok"], &["false"]);

    let agent = ScriptedAgent::new(vec![rename_batch("batch-001", "a.py")], Vec::new());
    let ctx = make_ctx(&env, "run-baseline", config);

    let outcome = execute_run(&ctx, &agent, &RunOptions::default(), |_| {
        panic!("confirmation must not be reached on baseline failure")
    })
    .expect("run");
    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.exit_code, exit_codes::BASELINE_FAILED);
    assert_eq!(agent.patch_calls.get(), 0);
}

/// The cadence full verifier runs every N applied batches and its failure
/// aborts the run.
#[test]
fn cadence_full_verifier_failure_aborts() {
    let env = setup(&[("a.py", A_PY), ("b.py", B_PY)]);
    // Full passes at baseline (no renames yet) but fails once a.py renames.
    let mut config = base_config(&["echo ok"], &["! grep -q bar a.py"]);
    config.run_full_verifier_every = 1;

    let agent = ScriptedAgent::new(
        vec![rename_batch("batch-001", "a.py"), rename_batch("batch-002", "b.py")],
        vec![
            ok_proposal("a.py", &rename_diff("a.py", "foo", "bar", "1")),
            ok_proposal("b.py", &rename_diff("b.py", "foo", "bar", "2")),
        ],
    );
    let ctx = make_ctx(&env, "run-cadence", config);

    let outcome =
        execute_run(&ctx, &agent, &RunOptions::default(), |_| Ok(true)).expect("run");
    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.exit_code, exit_codes::BATCH_FAILED);
    // Only the first batch ran; the cadence check stopped the run.
    assert_eq!(agent.patch_calls.get(), 1);
}
