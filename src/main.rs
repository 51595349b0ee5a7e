//! Checkpointed whole-repository refactoring orchestrator.
//!
//! Drives an external agent CLI through a plan of small, verifiable code
//! changes, applying each only if it survives deterministic checks, with an
//! isolated worktree, checkpoints, backups, and rollback.

use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use recast::core::index::CodeIndex;
use recast::core::types::{RefactorPlan, VerifierLevel};
use recast::exit_codes;
use recast::io::agent::{Agent, AgentAvailability, ClaudeAgent};
use recast::io::backup::{find_backup, list_backups, restore};
use recast::io::cancel::CancelToken;
use recast::io::config::RunConfig;
use recast::io::ledger::{Ledger, LedgerEntry};
use recast::io::paths::{CacheLayout, STATE_DIR, generate_run_id, repo_name};
use recast::io::verifier::Verifier;
use recast::orchestrator::{LEDGER_FILE, RunContext, RunOptions, execute_run};
use recast::planner::{PLAN_FILE, Planner, save_plan};

#[derive(Parser)]
#[command(
    name = "recast",
    version,
    about = "Checkpointed whole-repository refactoring driven by an agent CLI"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a refactoring plan without creating a worktree.
    Plan {
        repo: PathBuf,
        /// Write the plan here instead of `<repo>/.recast/plan.json`.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the full pipeline: backup, plan, confirm once, then autonomous.
    Run {
        repo: PathBuf,
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
        /// Generate and save the plan but apply nothing.
        #[arg(long)]
        dry_run: bool,
        /// Skip the pre-run backup (not recommended).
        #[arg(long)]
        skip_backup: bool,
        /// Keep the worktree even when the run ends early.
        #[arg(long)]
        keep_worktree: bool,
        /// Override the configured plan-length cap.
        #[arg(long)]
        max_batches: Option<usize>,
    },
    /// Run the baseline verifier only.
    Verify {
        repo: PathBuf,
        /// Run the full level instead of fast.
        #[arg(long)]
        full: bool,
    },
    /// Restore a repository from a named backup.
    Rollback {
        repo: PathBuf,
        #[arg(long)]
        backup_id: String,
    },
    /// Enumerate cached backup artifacts for a repository.
    ListBackups { repo: PathBuf },
}

fn main() {
    recast::logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::USER_ERROR
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Plan { repo, output } => cmd_plan(&repo, output.as_deref()),
        Command::Run {
            repo,
            yes,
            dry_run,
            skip_backup,
            keep_worktree,
            max_batches,
        } => cmd_run(&repo, yes, dry_run, skip_backup, keep_worktree, max_batches),
        Command::Verify { repo, full } => cmd_verify(&repo, full),
        Command::Rollback { repo, backup_id } => cmd_rollback(&repo, &backup_id),
        Command::ListBackups { repo } => cmd_list_backups(&repo),
    }
}

fn resolve_repo(repo: &Path) -> Result<PathBuf> {
    repo.canonicalize()
        .with_context(|| format!("repository not found: {}", repo.display()))
}

fn cmd_plan(repo: &Path, output: Option<&Path>) -> Result<i32> {
    let repo = resolve_repo(repo)?;
    let config = RunConfig::load(&repo)?;
    let index = CodeIndex::load(&repo.join(STATE_DIR))?;

    let planner = Planner::new(&repo, &config, &index);
    let plan = planner.draft();
    print_plan(&plan);

    let path = output
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| repo.join(STATE_DIR).join(PLAN_FILE));
    save_plan(&plan, &path)?;
    println!("plan saved to {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(
    repo: &Path,
    yes: bool,
    dry_run: bool,
    skip_backup: bool,
    keep_worktree: bool,
    max_batches: Option<usize>,
) -> Result<i32> {
    let repo = resolve_repo(repo)?;
    let mut config = RunConfig::load(&repo)?;
    if let Some(cap) = max_batches {
        config.max_batches = cap;
        config.validate()?;
    }

    let layout = CacheLayout::resolve()?;
    let run_id = generate_run_id();
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("install Ctrl-C handler")?;
    }

    let worktree = layout.worktree_for(&run_id);
    let agent = ClaudeAgent::new(
        &config.claude,
        &worktree,
        &worktree.join(STATE_DIR),
        Duration::from_secs(config.agent_timeout_secs),
        config.output_limit_bytes,
        cancel.clone(),
    );

    match agent.check_available()? {
        AgentAvailability::Ready { version } => println!("agent ready: {version}"),
        AgentAvailability::NotInstalled(message) => {
            eprintln!("agent binary not found: {message}");
            eprintln!("install it or set claude.binary in .recast.toml");
            return Ok(exit_codes::AGENT_UNAVAILABLE);
        }
        AgentAvailability::NotAuthenticated(message) => {
            eprintln!("agent is not authenticated: {message}");
            eprintln!("run the agent interactively and log in first");
            return Ok(exit_codes::AGENT_UNAVAILABLE);
        }
    }

    let ctx = RunContext {
        run_id: run_id.clone(),
        repo_path: repo,
        config,
        layout,
        cancel,
    };
    let options = RunOptions {
        skip_backup,
        dry_run,
        keep_worktree,
    };

    println!("run id: {run_id}");
    let outcome = execute_run(&ctx, &agent, &options, |plan| confirm_plan(plan, yes))?;

    if let Some(report) = &outcome.report {
        println!("\n{}", report.render());
    } else if outcome.exit_code == exit_codes::BASELINE_FAILED {
        eprintln!("baseline verification failed; fix the repository and retry");
    }
    Ok(outcome.exit_code)
}

fn confirm_plan(plan: &RefactorPlan, yes: bool) -> Result<bool> {
    print_plan(plan);
    if yes {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        anyhow::bail!("refusing to run without confirmation (pass --yes for non-interactive use)");
    }
    print!("Proceed with refactoring? [y/N] ");
    std::io::stdout().flush().context("flush stdout")?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("read confirmation")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn print_plan(plan: &RefactorPlan) {
    println!("plan: {} batches", plan.batches.len());
    for batch in &plan.batches {
        println!(
            "  [{}] {} (risk {}, budget {} loc, verifier {:?})",
            batch.id, batch.goal, batch.risk, batch.diff_budget_loc, batch.verifier
        );
    }
    println!("total budget: ~{} changed lines", plan.total_budget_loc());
}

fn cmd_verify(repo: &Path, full: bool) -> Result<i32> {
    let repo = resolve_repo(repo)?;
    let config = RunConfig::load(&repo)?;
    let verifier = Verifier::new(
        &repo,
        &repo.join(STATE_DIR),
        &config,
        CancelToken::new(),
    );

    let level = if full {
        VerifierLevel::Full
    } else {
        VerifierLevel::Fast
    };
    let result = verifier.run_level(level, "verify")?;
    for cmd in &result.commands {
        let mark = if cmd.passed() { "ok  " } else { "FAIL" };
        println!("  {mark} {} ({} ms)", cmd.command, cmd.duration_ms);
    }
    if result.passed() {
        println!("{}", result.summary());
        Ok(exit_codes::OK)
    } else {
        eprintln!("{}", result.summary());
        Ok(exit_codes::BASELINE_FAILED)
    }
}

fn cmd_rollback(repo: &Path, backup_id: &str) -> Result<i32> {
    let repo = resolve_repo(repo)?;
    let layout = CacheLayout::resolve()?;
    let Some(artifact) = find_backup(&layout, backup_id)? else {
        eprintln!("no backup found with id '{backup_id}' (see `recast list-backups`)");
        return Ok(exit_codes::USER_ERROR);
    };

    restore(&artifact, &repo)?;
    println!("restored {} from backup {}", repo.display(), backup_id);

    // The run's worktree may still exist; record the rollback in its ledger.
    let ledger_path = layout
        .worktree_for(backup_id)
        .join(STATE_DIR)
        .join(LEDGER_FILE);
    if ledger_path.exists() {
        let mut ledger = Ledger::open(&ledger_path)?;
        ledger.append(LedgerEntry::new(
            backup_id,
            "rollback",
            1,
            recast::core::types::BatchOutcome::RolledBack,
        ))?;
    }
    Ok(exit_codes::OK)
}

fn cmd_list_backups(repo: &Path) -> Result<i32> {
    let repo = resolve_repo(repo)?;
    let layout = CacheLayout::resolve()?;
    let backups = list_backups(&layout, Some(&repo_name(&repo)))?;
    if backups.is_empty() {
        println!("no backups found for {}", repo.display());
        return Ok(exit_codes::OK);
    }
    for backup in backups {
        let kinds = match (&backup.bundle, &backup.archive) {
            (Some(_), Some(_)) => "bundle+archive",
            (Some(_), None) => "bundle",
            (None, Some(_)) => "archive",
            (None, None) => "empty",
        };
        println!(
            "  {}  {}  {}  {} bytes",
            backup.run_id, backup.created_at, kinds, backup.size_bytes
        );
    }
    Ok(exit_codes::OK)
}
