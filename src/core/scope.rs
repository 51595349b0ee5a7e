//! Scope matching for batch file selection.
//!
//! Every batch carries include globs; the configuration contributes a global
//! exclude list. A path is in scope iff it matches at least one include and
//! no exclude.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Compiled include/exclude matcher for one batch.
#[derive(Debug)]
pub struct ScopeMatcher {
    include: GlobSet,
    exclude: GlobSet,
}

impl ScopeMatcher {
    pub fn new(scope: &[String], excludes: &[String]) -> Result<Self> {
        Ok(Self {
            include: build_glob_set(scope)?,
            exclude: build_glob_set(excludes)?,
        })
    }

    pub fn is_in_scope(&self, path: &str) -> bool {
        self.include.is_match(path) && !self.exclude.is_match(path)
    }

    /// Paths from `paths` that fall outside the scope, preserving order.
    pub fn violations<'a, I>(&self, paths: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        paths
            .into_iter()
            .filter(|p| !self.is_in_scope(p))
            .map(|p| p.to_string())
            .collect()
    }

    /// Filter `paths` down to the in-scope subset, preserving order.
    pub fn select<'a, I>(&self, paths: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        paths
            .into_iter()
            .filter(|p| self.is_in_scope(p))
            .map(|p| p.to_string())
            .collect()
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).with_context(|| format!("invalid scope glob '{pattern}'"))?;
        builder.add(glob);
    }
    builder.build().context("compile scope globs")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(scope: &[&str], excludes: &[&str]) -> ScopeMatcher {
        let scope: Vec<String> = scope.iter().map(|s| s.to_string()).collect();
        let excludes: Vec<String> = excludes.iter().map(|s| s.to_string()).collect();
        ScopeMatcher::new(&scope, &excludes).expect("build matcher")
    }

    #[test]
    fn matches_recursive_globs() {
        let m = matcher(&["src/**"], &[]);
        assert!(m.is_in_scope("src/a.py"));
        assert!(m.is_in_scope("src/nested/deep/b.py"));
        assert!(!m.is_in_scope("README.md"));
    }

    #[test]
    fn excludes_take_precedence() {
        let m = matcher(&["**/*.py"], &["**/dist/**", "**/.venv/**"]);
        assert!(m.is_in_scope("pkg/module.py"));
        assert!(!m.is_in_scope("dist/pkg/module.py"));
        assert!(!m.is_in_scope(".venv/lib/site.py"));
    }

    #[test]
    fn literal_paths_work_as_scope_entries() {
        let m = matcher(&["src/util.py"], &[]);
        assert!(m.is_in_scope("src/util.py"));
        assert!(!m.is_in_scope("src/other.py"));
    }

    #[test]
    fn violations_reports_out_of_scope_paths() {
        let m = matcher(&["src/**"], &[]);
        let got = m.violations(["src/a.py", "README.md", "src/b.py", "docs/x.md"]);
        assert_eq!(got, vec!["README.md".to_string(), "docs/x.md".to_string()]);
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let scope = vec!["src/[".to_string()];
        assert!(ScopeMatcher::new(&scope, &[]).is_err());
    }
}
