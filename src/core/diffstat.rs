//! Unified diff inspection: line counts, touched paths, binary detection.
//!
//! The patch applier validates every proposal against its batch budget before
//! the filesystem is touched, so parsing here is strict about file headers but
//! tolerant of context noise the way `git apply` itself is.

use anyhow::{Result, anyhow};

/// Parsed statistics for a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffStats {
    pub lines_added: usize,
    pub lines_removed: usize,
    /// Touched paths, sorted and deduplicated.
    pub files: Vec<String>,
    /// True if the diff contains binary hunks.
    pub has_binary: bool,
}

impl DiffStats {
    pub fn total_changed(&self) -> usize {
        self.lines_added + self.lines_removed
    }
}

/// Parse a unified diff into change statistics.
///
/// Errors when the text is empty or names no files (a patch that `git apply`
/// could never act on).
pub fn parse(diff: &str) -> Result<DiffStats> {
    if diff.trim().is_empty() {
        return Err(anyhow!("empty patch"));
    }

    let mut lines_added = 0usize;
    let mut lines_removed = 0usize;
    let mut files = Vec::new();
    let mut has_binary = false;
    let mut in_hunk = false;

    for line in diff.lines() {
        if let Some(path) = line.strip_prefix("+++ ") {
            push_header_path(&mut files, path, "b/");
            in_hunk = false;
            continue;
        }
        if let Some(path) = line.strip_prefix("--- ") {
            push_header_path(&mut files, path, "a/");
            in_hunk = false;
            continue;
        }
        if line.starts_with("Binary files ") || line.starts_with("GIT binary patch") {
            has_binary = true;
            in_hunk = false;
            continue;
        }
        if line.starts_with("@@") {
            in_hunk = true;
            continue;
        }
        if line.starts_with("diff ") || line.starts_with("index ") {
            in_hunk = false;
            continue;
        }
        if in_hunk {
            if line.starts_with('+') {
                lines_added += 1;
            } else if line.starts_with('-') {
                lines_removed += 1;
            }
        }
    }

    if files.is_empty() {
        return Err(anyhow!("patch names no files"));
    }

    files.sort();
    files.dedup();

    Ok(DiffStats {
        lines_added,
        lines_removed,
        files,
        has_binary,
    })
}

fn push_header_path(files: &mut Vec<String>, raw: &str, prefix: &str) {
    // Header paths may carry a trailing tab + metadata (git appends mode info).
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    if path == "/dev/null" {
        return;
    }
    let path = path.strip_prefix(prefix).unwrap_or(path);
    if !path.is_empty() {
        files.push(path.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENAME_DIFF: &str = "\
diff --git a/src/a.py b/src/a.py
index 111..222 100644
--- a/src/a.py
+++ b/src/a.py
@@ -1,3 +1,3 @@
-def foo():
+def bar():
     return 1
";

    #[test]
    fn parses_simple_rename_diff() {
        let stats = parse(RENAME_DIFF).expect("parse");
        assert_eq!(stats.lines_added, 1);
        assert_eq!(stats.lines_removed, 1);
        assert_eq!(stats.files, vec!["src/a.py".to_string()]);
        assert!(!stats.has_binary);
        assert_eq!(stats.total_changed(), 2);
    }

    #[test]
    fn collects_files_from_both_headers_for_new_and_deleted_files() {
        let diff = "\
--- /dev/null
+++ b/src/new.py
@@ -0,0 +1,2 @@
+x = 1
+y = 2
";
        let stats = parse(diff).expect("parse");
        assert_eq!(stats.files, vec!["src/new.py".to_string()]);
        assert_eq!(stats.lines_added, 2);
        assert_eq!(stats.lines_removed, 0);
    }

    #[test]
    fn detects_binary_hunks() {
        let diff = "\
diff --git a/logo.png b/logo.png
Binary files a/logo.png and b/logo.png differ
--- a/logo.png
+++ b/logo.png
";
        let stats = parse(diff).expect("parse");
        assert!(stats.has_binary);
    }

    #[test]
    fn rejects_empty_and_fileless_patches() {
        assert!(parse("").is_err());
        assert!(parse("   \n  ").is_err());
        assert!(parse("@@ -1 +1 @@\n-a\n+b\n").is_err());
    }

    #[test]
    fn does_not_count_header_lines_as_changes() {
        let stats = parse(RENAME_DIFF).expect("parse");
        // `--- a/...` and `+++ b/...` must not inflate the counts.
        assert_eq!(stats.total_changed(), 2);
    }
}
