//! Read-only view over the index artifacts produced by the external indexer.
//!
//! The indexer writes `symbols.json` and `deps.json` into the worktree's
//! state directory. The orchestrator never regenerates them; it reloads them
//! after each applied batch so planning and context packing see fresh data.
//! Missing artifacts degrade to an empty index.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const SYMBOLS_FILE: &str = "symbols.json";
pub const DEPS_FILE: &str = "deps.json";

/// One extracted symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    pub name: String,
    pub kind: String,
    pub line: usize,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub exported: bool,
}

/// Per-file symbol information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub lines: usize,
    #[serde(default)]
    pub symbols: Vec<SymbolEntry>,
}

/// Per-file dependency information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepNode {
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub imported_by: Vec<String>,
    #[serde(default)]
    pub fan_in: usize,
    #[serde(default)]
    pub fan_out: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SymbolRegistry {
    #[serde(default)]
    files: BTreeMap<String, FileEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DepGraph {
    #[serde(default)]
    nodes: BTreeMap<String, DepNode>,
}

/// Combined read-only code index.
#[derive(Debug, Clone, Default)]
pub struct CodeIndex {
    pub files: BTreeMap<String, FileEntry>,
    pub deps: BTreeMap<String, DepNode>,
}

impl CodeIndex {
    /// Load index artifacts from a state directory. Absent files yield an
    /// empty index rather than an error; the planner and context pack both
    /// degrade gracefully.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let symbols_path = state_dir.join(SYMBOLS_FILE);
        let deps_path = state_dir.join(DEPS_FILE);

        let registry = if symbols_path.exists() {
            let raw = fs::read_to_string(&symbols_path)
                .with_context(|| format!("read {}", symbols_path.display()))?;
            serde_json::from_str::<SymbolRegistry>(&raw)
                .with_context(|| format!("parse {}", symbols_path.display()))?
        } else {
            SymbolRegistry::default()
        };

        let graph = if deps_path.exists() {
            let raw = fs::read_to_string(&deps_path)
                .with_context(|| format!("read {}", deps_path.display()))?;
            serde_json::from_str::<DepGraph>(&raw)
                .with_context(|| format!("parse {}", deps_path.display()))?
        } else {
            DepGraph::default()
        };

        Ok(Self {
            files: registry.files,
            deps: graph.nodes,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.deps.is_empty()
    }

    /// Files with fan-in at or above `min_fan_in`, highest first.
    pub fn hotspots(&self, min_fan_in: usize) -> Vec<(&str, &DepNode)> {
        let mut out: Vec<(&str, &DepNode)> = self
            .deps
            .iter()
            .filter(|(_, node)| node.fan_in >= min_fan_in)
            .map(|(path, node)| (path.as_str(), node))
            .collect();
        out.sort_by(|a, b| b.1.fan_in.cmp(&a.1.fan_in).then_with(|| a.0.cmp(b.0)));
        out
    }

    /// Files no other file depends on.
    pub fn leaves(&self) -> Vec<&str> {
        self.deps
            .iter()
            .filter(|(_, node)| node.fan_in == 0)
            .map(|(path, _)| path.as_str())
            .collect()
    }

    /// Indexed files grouped by language, deterministically ordered.
    pub fn files_by_language(&self) -> BTreeMap<String, Vec<String>> {
        let mut by_lang: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (path, entry) in &self.files {
            if entry.language.is_empty() {
                continue;
            }
            by_lang
                .entry(entry.language.clone())
                .or_default()
                .push(path.clone());
        }
        by_lang
    }

    /// Snapshot of the public API surface: every exported symbol with its
    /// signature, sorted for stable comparison.
    pub fn api_surface(&self) -> ApiSnapshot {
        let mut symbols = Vec::new();
        for (path, entry) in &self.files {
            for symbol in &entry.symbols {
                if symbol.exported {
                    symbols.push(ApiSymbol {
                        file: path.clone(),
                        name: symbol.name.clone(),
                        kind: symbol.kind.clone(),
                        signature: symbol.signature.clone(),
                    });
                }
            }
        }
        symbols.sort();
        ApiSnapshot { symbols }
    }
}

/// One exported symbol in the public API surface.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApiSymbol {
    pub file: String,
    pub name: String,
    pub kind: String,
    pub signature: String,
}

/// Public API surface captured before the run and after each applied batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSnapshot {
    pub symbols: Vec<ApiSymbol>,
}

impl ApiSnapshot {
    /// Human-readable differences from `self` (before) to `after`.
    /// Empty means the public surface is unchanged.
    pub fn diff(&self, after: &ApiSnapshot) -> Vec<String> {
        let mut changes = Vec::new();
        for symbol in &self.symbols {
            if !after.symbols.contains(symbol) {
                changes.push(format!("removed {} {} ({})", symbol.kind, symbol.name, symbol.file));
            }
        }
        for symbol in &after.symbols {
            if !self.symbols.contains(symbol) {
                changes.push(format!("added {} {} ({})", symbol.kind, symbol.name, symbol.file));
            }
        }
        changes
    }
}
