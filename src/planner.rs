//! Two-phase refactoring planner.
//!
//! Phase 1 is a deterministic heuristic over the index that orders work by
//! risk: formatting first, cleanup next, local changes, test seams, larger
//! restructures, architecture last. Phase 2 optionally hands the draft to the
//! agent for refinement; a refinement that widens scope, invents operations,
//! raises budgets, or overflows the batch cap is rejected and the draft kept.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::core::index::CodeIndex;
use crate::core::scope::ScopeMatcher;
use crate::core::types::{Batch, OperationKind, RefactorPlan, VerifierLevel};
use crate::io::agent::Agent;
use crate::io::config::RunConfig;
use crate::io::context::ContextPackBuilder;

pub const PLAN_FILE: &str = "plan.json";

/// Generates and refines refactoring plans.
pub struct Planner<'a> {
    repo_display: String,
    config: &'a RunConfig,
    index: &'a CodeIndex,
    counter: std::cell::Cell<usize>,
}

impl<'a> Planner<'a> {
    pub fn new(repo: &Path, config: &'a RunConfig, index: &'a CodeIndex) -> Self {
        Self {
            repo_display: repo.display().to_string(),
            config,
            index,
            counter: std::cell::Cell::new(0),
        }
    }

    fn next_id(&self) -> String {
        let next = self.counter.get() + 1;
        self.counter.set(next);
        format!("batch-{next:03}")
    }

    /// Risk estimate from aggregate fan-in of the touched files.
    fn estimate_risk(&self, files: &[&str]) -> u8 {
        if self.index.deps.is_empty() {
            return 50;
        }
        let total_fan_in: usize = files
            .iter()
            .filter_map(|f| self.index.deps.get(*f))
            .map(|n| n.fan_in)
            .sum();
        if total_fan_in <= 5 {
            20
        } else if total_fan_in <= 20 {
            50
        } else {
            (50 + total_fan_in).min(80) as u8
        }
    }

    /// Phase 1: the heuristic draft, ordered by the risk-limiting policy.
    pub fn draft(&self) -> RefactorPlan {
        let mut batches = Vec::new();
        let by_language = self.index.files_by_language();

        // 1. Formatting-only pass.
        if self.config.allow_formatting_only && self.config.formatter_command.is_some() {
            for (language, files) in &by_language {
                let Some(ext) = language_extension(language) else {
                    continue;
                };
                if files.is_empty() {
                    continue;
                }
                batches.push(Batch {
                    id: self.next_id(),
                    goal: format!("Format all {language} files"),
                    scope: vec![format!("**/*.{ext}")],
                    operations: vec![OperationKind::FormatOnly],
                    diff_budget_loc: self.config.diff_budget_loc.min(100),
                    risk: 5,
                    verifier: VerifierLevel::Fast,
                    critical: false,
                    notes: "Formatting only, no logic changes".to_string(),
                });
            }
        }

        // 2. Import cleanup and dead-code removal.
        for (language, files) in &by_language {
            let Some(ext) = language_extension(language) else {
                continue;
            };
            if files.is_empty() {
                continue;
            }
            batches.push(Batch {
                id: self.next_id(),
                goal: format!("Remove unused imports and dead code in {language} files"),
                scope: vec![format!("**/*.{ext}")],
                operations: vec![
                    OperationKind::RemoveUnusedImports,
                    OperationKind::RemoveDeadCode,
                ],
                diff_budget_loc: self.config.diff_budget_loc.min(150),
                risk: 15,
                verifier: VerifierLevel::Fast,
                critical: false,
                notes: "Only remove code that is provably unreferenced".to_string(),
            });
        }

        // 3. Local renames and small extractions: high fan-in files one by
        // one under the full verifier, leaf modules together under fast.
        let hotspots = self.index.hotspots(3);
        for &(path, node) in hotspots.iter().take(5) {
            batches.push(Batch {
                id: self.next_id(),
                goal: format!("Tidy high-impact module {path}"),
                scope: vec![path.to_string()],
                operations: vec![OperationKind::Rename, OperationKind::ExtractFunction],
                diff_budget_loc: self.config.diff_budget_loc,
                risk: self.estimate_risk(&[path]),
                verifier: VerifierLevel::Full,
                critical: false,
                notes: format!("High fan-in ({}): many files depend on this", node.fan_in),
            });
        }
        let leaves = self.index.leaves();
        if !leaves.is_empty() {
            let scope: Vec<String> = leaves.iter().take(10).map(|p| p.to_string()).collect();
            batches.push(Batch {
                id: self.next_id(),
                goal: "Refactor leaf modules (no dependents)".to_string(),
                scope,
                operations: vec![
                    OperationKind::Rename,
                    OperationKind::ExtractFunction,
                    OperationKind::RefactorInternal,
                ],
                diff_budget_loc: self.config.diff_budget_loc,
                risk: 20,
                verifier: VerifierLevel::Fast,
                critical: false,
                notes: "No other files depend on these".to_string(),
            });
        }

        // 4. Test seams around the riskiest modules.
        if !hotspots.is_empty() {
            let scope: Vec<String> = hotspots
                .iter()
                .take(5)
                .map(|(p, _)| p.to_string())
                .collect();
            batches.push(Batch {
                id: self.next_id(),
                goal: "Add test seams around high fan-in modules".to_string(),
                scope,
                operations: vec![OperationKind::AddTests],
                diff_budget_loc: self.config.diff_budget_loc,
                risk: 30,
                verifier: VerifierLevel::Fast,
                critical: false,
                notes: "Tests only; production code unchanged".to_string(),
            });
        }

        // 5. Larger internal restructures: the biggest indexed files.
        let mut by_size: Vec<(&String, usize)> = self
            .index
            .files
            .iter()
            .filter(|(_, entry)| entry.lines > 300)
            .map(|(path, entry)| (path, entry.lines))
            .collect();
        by_size.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        for (path, lines) in by_size.iter().take(3) {
            batches.push(Batch {
                id: self.next_id(),
                goal: format!("Split oversized module {path}"),
                scope: vec![path.to_string()],
                operations: vec![OperationKind::RefactorInternal, OperationKind::SplitModule],
                diff_budget_loc: self.config.diff_budget_loc,
                risk: 60,
                verifier: VerifierLevel::Full,
                critical: false,
                notes: format!("{lines} lines"),
            });
        }

        // 6. Architecture-level transforms come last.
        if self.index.deps.len() >= 10 {
            batches.push(Batch {
                id: self.next_id(),
                goal: "Align module boundaries with the dependency structure".to_string(),
                scope: vec!["**/*".to_string()],
                operations: vec![OperationKind::Architecture],
                diff_budget_loc: self.config.diff_budget_loc,
                risk: 85,
                verifier: VerifierLevel::Full,
                critical: false,
                notes: "Highest-risk pass; runs only after everything else held".to_string(),
            });
        }

        // Without an index there is nothing to rank; fall back to one
        // conservative cleanup batch so `plan` still produces output.
        if batches.is_empty() {
            batches.push(Batch {
                id: self.next_id(),
                goal: "Tidy repository modules".to_string(),
                scope: vec!["**/*".to_string()],
                operations: vec![
                    OperationKind::Rename,
                    OperationKind::RemoveDeadCode,
                    OperationKind::RefactorInternal,
                ],
                diff_budget_loc: self.config.diff_budget_loc,
                risk: 30,
                verifier: VerifierLevel::Fast,
                critical: false,
                notes: "No index artifacts were available".to_string(),
            });
        }

        batches.truncate(self.config.max_batches);
        info!(batches = batches.len(), "heuristic plan generated");

        RefactorPlan {
            batches,
            created_at: Utc::now().to_rfc3339(),
            repo_path: self.repo_display.clone(),
        }
    }

    /// Phase 2: optional agent refinement, falling back to the draft when the
    /// agent fails or the refinement violates its bounds.
    pub fn refine<A: Agent>(
        &self,
        draft: RefactorPlan,
        agent: &A,
        builder: &ContextPackBuilder<'_>,
    ) -> RefactorPlan {
        if !self.config.use_agent_planner {
            return draft;
        }

        let prompt = match builder.build_planner_prompt(&draft) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(%err, "failed to build planner prompt, keeping draft");
                return draft;
            }
        };

        let response = match agent.refine_plan(&prompt) {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "planner agent failed, keeping draft");
                return draft;
            }
        };

        match self.validate_refinement(&draft, response.batches) {
            Ok(batches) => {
                info!(batches = batches.len(), "agent refinement accepted");
                RefactorPlan {
                    batches,
                    created_at: draft.created_at,
                    repo_path: draft.repo_path,
                }
            }
            Err(err) => {
                warn!(%err, "agent refinement rejected, keeping draft");
                draft
            }
        }
    }

    /// A refinement is acceptable only when it stays inside the draft's
    /// envelope: batch count, budgets, operation kinds, and file scope.
    fn validate_refinement(
        &self,
        draft: &RefactorPlan,
        refined: Vec<Batch>,
    ) -> Result<Vec<Batch>> {
        if refined.is_empty() {
            anyhow::bail!("refined plan is empty");
        }
        if refined.len() > self.config.max_batches {
            anyhow::bail!(
                "refined plan has {} batches (max {})",
                refined.len(),
                self.config.max_batches
            );
        }

        let mut ids = BTreeSet::new();
        for batch in &refined {
            if !ids.insert(batch.id.clone()) {
                anyhow::bail!("duplicate batch id '{}'", batch.id);
            }
        }

        let allowed_ops: BTreeSet<OperationKind> = draft
            .batches
            .iter()
            .flat_map(|b| b.operations.iter().copied())
            .collect();
        let draft_globs: Vec<String> = draft
            .batches
            .iter()
            .flat_map(|b| b.scope.iter().cloned())
            .collect();
        let draft_scope = ScopeMatcher::new(&draft_globs, &[])?;

        for batch in &refined {
            if batch.operations.is_empty() {
                anyhow::bail!("batch '{}' has no operations", batch.id);
            }
            for op in &batch.operations {
                if !allowed_ops.contains(op) {
                    anyhow::bail!("batch '{}' uses operation outside the draft set", batch.id);
                }
            }
            if batch.diff_budget_loc > self.config.diff_budget_loc {
                anyhow::bail!(
                    "batch '{}' budget {} exceeds configured {}",
                    batch.id,
                    batch.diff_budget_loc,
                    self.config.diff_budget_loc
                );
            }
            if batch.scope.is_empty() {
                anyhow::bail!("batch '{}' has empty scope", batch.id);
            }
            self.ensure_scope_subset(batch, &draft_scope, &draft_globs)?;
        }

        Ok(refined)
    }

    /// Scope-subset check. With an index, every file the refined scope
    /// matches must also match the draft scope; without one, each refined
    /// glob must literally appear in the draft or itself fall inside the
    /// draft's patterns (a literal path narrowed out of a wider glob).
    fn ensure_scope_subset(
        &self,
        batch: &Batch,
        draft_scope: &ScopeMatcher,
        draft_globs: &[String],
    ) -> Result<()> {
        if self.index.files.is_empty() {
            for glob in &batch.scope {
                if !draft_globs.contains(glob) && !draft_scope.is_in_scope(glob) {
                    anyhow::bail!(
                        "batch '{}' scope '{}' is not part of the draft scope",
                        batch.id,
                        glob
                    );
                }
            }
            return Ok(());
        }

        let refined_scope = ScopeMatcher::new(&batch.scope, &[])?;
        for path in self.index.files.keys() {
            if refined_scope.is_in_scope(path) && !draft_scope.is_in_scope(path) {
                anyhow::bail!(
                    "batch '{}' widens scope to '{}' beyond the draft",
                    batch.id,
                    path
                );
            }
        }
        Ok(())
    }
}

/// Persist a frozen plan as pretty JSON.
pub fn save_plan(plan: &RefactorPlan, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))?;
    debug!(path = %path.display(), "plan saved");
    Ok(())
}

pub fn load_plan(path: &Path) -> Result<RefactorPlan> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn language_extension(language: &str) -> Option<&'static str> {
    match language {
        "python" => Some("py"),
        "javascript" => Some("js"),
        "typescript" => Some("ts"),
        "rust" => Some("rs"),
        "go" => Some("go"),
        "java" => Some("java"),
        "ruby" => Some("rb"),
        "c" => Some("c"),
        "cpp" => Some("cpp"),
        _ => None,
    }
}
