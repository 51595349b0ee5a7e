//! Deterministic context pack builder.
//!
//! Selects and size-bounds the material sent to the agent for one batch. The
//! agent never produces these summaries: everything here is computed from the
//! worktree, the index artifacts, and the ledger tail, so the same inputs
//! always yield the same packet.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::index::CodeIndex;
use crate::core::scope::ScopeMatcher;
use crate::core::types::{Batch, RefactorPlan, VerifierLevel};
use crate::io::config::RunConfig;
use crate::io::ledger::Ledger;

const PATCHER_TEMPLATE: &str = include_str!("../prompts/patcher.md");
const PLANNER_TEMPLATE: &str = include_str!("../prompts/planner.md");

/// Files at or under this many lines are included whole.
const TINY_FILE_LINES: usize = 60;
/// Maximum lines for one symbol excerpt.
const EXCERPT_LINES: usize = 30;
/// Excerpted symbols per large file.
const EXCERPTS_PER_FILE: usize = 3;
/// Upper bound on worktree walking when no index is available.
const WALK_FILE_CAP: usize = 2000;

/// A bounded packet for one agent call, with the files it references.
#[derive(Debug, Clone)]
pub struct ContextPack {
    pub prompt: String,
    pub manifest: Vec<String>,
}

/// Tracks context budget usage in characters and excerpt lines.
#[derive(Debug)]
struct Budget {
    max_chars: usize,
    max_lines: usize,
    used_chars: usize,
    used_lines: usize,
}

impl Budget {
    fn new(config: &RunConfig) -> Self {
        Self {
            max_chars: config.max_context_chars,
            max_lines: config.max_excerpt_lines,
            used_chars: 0,
            used_lines: 0,
        }
    }

    fn can_add(&self, chars: usize, lines: usize) -> bool {
        self.used_chars + chars <= self.max_chars && self.used_lines + lines <= self.max_lines
    }

    fn add(&mut self, chars: usize, lines: usize) {
        self.used_chars += chars;
        self.used_lines += lines;
    }
}

/// Builds context packets for agent calls.
pub struct ContextPackBuilder<'a> {
    worktree: &'a Path,
    config: &'a RunConfig,
    index: &'a CodeIndex,
    ledger: &'a Ledger,
}

impl<'a> ContextPackBuilder<'a> {
    pub fn new(
        worktree: &'a Path,
        config: &'a RunConfig,
        index: &'a CodeIndex,
        ledger: &'a Ledger,
    ) -> Self {
        Self {
            worktree,
            config,
            index,
            ledger,
        }
    }

    /// Build the user prompt for one patcher invocation.
    ///
    /// `constraints` carries rejection feedback from earlier attempts on the
    /// same batch.
    pub fn build_patcher_prompt(
        &self,
        batch: &Batch,
        scope: &ScopeMatcher,
        constraints: &[String],
    ) -> Result<ContextPack> {
        let mut budget = Budget::new(self.config);
        let selection = self.ordered_selection(scope);

        let mut files_section = String::new();
        let mut manifest = Vec::new();
        for path in &selection {
            let Some(block) = self.render_file(path, &mut budget)? else {
                continue;
            };
            files_section.push_str(&block);
            files_section.push('\n');
            manifest.push(path.clone());
        }
        if manifest.is_empty() {
            files_section.push_str("(no files matched the batch scope)\n");
        }

        let ledger_section = self.ledger_section(&mut budget);

        let operations: Vec<String> = batch.operations.iter().map(wire_name).collect();
        let verifier = match batch.verifier {
            VerifierLevel::Fast => "fast",
            VerifierLevel::Full => "full",
        };

        let env = template_env()?;
        let prompt = env
            .get_template("patcher")?
            .render(context! {
                batch => batch,
                operations => operations,
                verifier => verifier,
                constraints => constraints,
                files_section => files_section.trim_end(),
                ledger_section => ledger_section,
            })
            .context("render patcher prompt")?;

        debug!(
            files = manifest.len(),
            chars = prompt.len(),
            "context pack built"
        );
        Ok(ContextPack { prompt, manifest })
    }

    /// Build the user prompt for the plan-refinement invocation.
    pub fn build_planner_prompt(&self, draft: &RefactorPlan) -> Result<String> {
        let stats_section = if self.index.is_empty() {
            None
        } else {
            Some(format!(
                "- Files indexed: {}\n- Dependency nodes: {}",
                self.index.files.len(),
                self.index.deps.len()
            ))
        };

        let hotspots = self.index.hotspots(3);
        let hotspots_section = if hotspots.is_empty() {
            None
        } else {
            let lines: Vec<String> = hotspots
                .iter()
                .take(10)
                .map(|(path, node)| format!("- {path} (fan-in: {})", node.fan_in))
                .collect();
            Some(lines.join("\n"))
        };

        let plan_json = serde_json::to_string_pretty(draft).context("serialize draft plan")?;

        let env = template_env()?;
        env.get_template("planner")?
            .render(context! {
                max_batches => self.config.max_batches,
                diff_budget_loc => self.config.diff_budget_loc,
                allow_public_api_changes => self.config.allow_public_api_changes,
                stats_section => stats_section,
                hotspots_section => hotspots_section,
                plan_json => plan_json,
            })
            .context("render planner prompt")
    }

    /// Retrieval policy: recently-touched in-scope files first, then the rest
    /// of the scope by descending fan-in, then files imported by the scope.
    fn ordered_selection(&self, scope: &ScopeMatcher) -> Vec<String> {
        let scope_files = self.scope_files(scope);

        let mut ordered = Vec::new();
        for path in self.ledger.recently_touched() {
            if scope_files.contains(&path) && !ordered.contains(&path) {
                ordered.push(path);
            }
        }

        let mut remaining: Vec<&String> =
            scope_files.iter().filter(|p| !ordered.contains(*p)).collect();
        remaining.sort_by(|a, b| {
            let fan = |p: &str| self.index.deps.get(p).map(|n| n.fan_in).unwrap_or(0);
            fan(b).cmp(&fan(a)).then_with(|| a.cmp(b))
        });
        ordered.extend(remaining.into_iter().cloned());

        // Imports give the agent the call-site side of the seam.
        let mut imports = Vec::new();
        for path in &ordered {
            if let Some(node) = self.index.deps.get(path) {
                for import in &node.imports {
                    if !ordered.contains(import) && !imports.contains(import) {
                        imports.push(import.clone());
                    }
                }
            }
        }
        imports.sort();
        ordered.extend(imports);
        ordered
    }

    fn scope_files(&self, scope: &ScopeMatcher) -> Vec<String> {
        if !self.index.files.is_empty() {
            return scope.select(self.index.files.keys().map(String::as_str));
        }
        // No index artifacts: fall back to walking the worktree.
        let mut files = Vec::new();
        walk_files(self.worktree, self.worktree, &mut files);
        files.sort();
        scope.select(files.iter().map(String::as_str))
    }

    /// Render one file within budget. Tiny files go in whole; larger files
    /// get their symbol signatures plus short excerpts around leading symbols.
    fn render_file(&self, path: &str, budget: &mut Budget) -> Result<Option<String>> {
        let full_path = self.worktree.join(path);
        let Ok(content) = fs::read_to_string(&full_path) else {
            return Ok(None);
        };
        let lines: Vec<&str> = content.lines().collect();

        if lines.len() <= TINY_FILE_LINES {
            let block = format!("### {path}\n```\n{content}\n```\n");
            if !budget.can_add(block.len(), lines.len()) {
                return Ok(None);
            }
            budget.add(block.len(), lines.len());
            return Ok(Some(block));
        }

        let mut block = format!("### {path} ({} lines)\n", lines.len());
        if let Some(entry) = self.index.files.get(path) {
            for symbol in entry.symbols.iter().take(20) {
                let sig = if symbol.signature.is_empty() {
                    &symbol.name
                } else {
                    &symbol.signature
                };
                block.push_str(&format!("- {} {} (line {})\n", symbol.kind, sig, symbol.line));
            }
        }

        let windows = excerpt_windows(self.index, path, lines.len());
        let mut excerpt_lines = 0usize;
        for (start, end) in windows {
            block.push_str(&format!("```{path}:{}-{}\n", start + 1, end));
            for line in &lines[start..end] {
                block.push_str(line);
                block.push('\n');
            }
            block.push_str("```\n");
            excerpt_lines += end - start;
        }

        if !budget.can_add(block.len(), excerpt_lines) {
            return Ok(None);
        }
        budget.add(block.len(), excerpt_lines);
        Ok(Some(block))
    }

    fn ledger_section(&self, budget: &mut Budget) -> Option<String> {
        let tail = self.ledger.tail(self.config.max_ledger_entries);
        if tail.is_empty() {
            return None;
        }
        let mut lines = Vec::new();
        for entry in tail {
            let line = format!(
                "- [{}] attempt {} -> {:?}{}",
                entry.batch_id,
                entry.attempt,
                entry.outcome,
                entry
                    .error
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            );
            if !budget.can_add(line.len(), 0) {
                break;
            }
            budget.add(line.len(), 0);
            lines.push(line);
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

/// Merged line windows around the file's leading indexed symbols. Without
/// symbols the head of the file is the only window.
fn excerpt_windows(index: &CodeIndex, path: &str, total_lines: usize) -> Vec<(usize, usize)> {
    let mut anchors: Vec<usize> = index
        .files
        .get(path)
        .map(|entry| {
            entry
                .symbols
                .iter()
                .take(EXCERPTS_PER_FILE)
                .map(|s| s.line.saturating_sub(1))
                .collect()
        })
        .unwrap_or_default();
    if anchors.is_empty() {
        anchors.push(0);
    }

    let mut windows: Vec<(usize, usize)> = Vec::new();
    for anchor in anchors {
        let start = anchor.saturating_sub(EXCERPT_LINES / 2).min(total_lines);
        let end = (start + EXCERPT_LINES).min(total_lines);
        match windows.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => windows.push((start, end)),
        }
    }
    windows
}

fn walk_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    if out.len() >= WALK_FILE_CAP {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == ".git" || name == ".recast" {
            continue;
        }
        if path.is_dir() {
            walk_files(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}

fn template_env() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("patcher", PATCHER_TEMPLATE)
        .context("register patcher template")?;
    env.add_template("planner", PLANNER_TEMPLATE)
        .context("register planner template")?;
    Ok(env)
}

fn wire_name(op: &crate::core::types::OperationKind) -> String {
    serde_json::to_value(op)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| format!("{op:?}"))
}
