//! Pre-run backups and restore.
//!
//! Two artifacts per run: a git bundle of all refs (version-controlled repos)
//! and a tar.gz snapshot of the working tree (always). Restore prefers the
//! bundle and falls back to the archive; it stages into a sibling directory
//! and swaps, parking the displaced tree at `<target>.pre-restore`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::io::cancel::CancelToken;
use crate::io::git::Git;
use crate::io::paths::{CacheLayout, repo_name};
use crate::io::process::run_command_with_timeout;

pub const BUNDLE_FILE: &str = "backup.bundle";
pub const ARCHIVE_FILE: &str = "snapshot.tar.gz";
pub const METADATA_FILE: &str = "metadata.json";

/// Directories never worth archiving.
const ARCHIVE_EXCLUDES: [&str; 7] = [
    ".git",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "dist",
    "build",
];

const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupMetadata {
    run_id: String,
    repo_name: String,
    repo_path: String,
    created_at: String,
    has_bundle: bool,
    has_archive: bool,
}

/// A completed backup, keyed by run id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub run_id: String,
    pub repo_name: String,
    pub dir: PathBuf,
    pub bundle: Option<PathBuf>,
    pub archive: Option<PathBuf>,
    pub created_at: String,
    pub size_bytes: u64,
}

/// Creates and restores backups for one repository.
#[derive(Debug)]
pub struct BackupManager {
    repo_path: PathBuf,
    repo_name: String,
    run_id: String,
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(layout: &CacheLayout, repo_path: &Path, run_id: &str) -> Self {
        let name = repo_name(repo_path);
        Self {
            repo_path: repo_path.to_path_buf(),
            backup_dir: layout.backup_for(&name, run_id),
            repo_name: name,
            run_id: run_id.to_string(),
        }
    }

    /// Take a full snapshot of the repository before any plan executes.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub fn snapshot(&self) -> Result<BackupArtifact> {
        fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("create backup dir {}", self.backup_dir.display()))?;

        let bundle = if Git::is_repo(&self.repo_path) {
            let path = self.backup_dir.join(BUNDLE_FILE);
            Git::new(&self.repo_path)
                .bundle_create(&path)
                .context("create git bundle")?;
            debug!(path = %path.display(), "bundle written");
            Some(path)
        } else {
            None
        };

        let archive = self.backup_dir.join(ARCHIVE_FILE);
        self.create_archive(&archive).context("create archive")?;

        let created_at = Utc::now().to_rfc3339();
        let metadata = BackupMetadata {
            run_id: self.run_id.clone(),
            repo_name: self.repo_name.clone(),
            repo_path: self.repo_path.display().to_string(),
            created_at: created_at.clone(),
            has_bundle: bundle.is_some(),
            has_archive: true,
        };
        write_metadata(&self.backup_dir.join(METADATA_FILE), &metadata)?;

        let size_bytes = file_size(bundle.as_deref()) + file_size(Some(archive.as_path()));
        info!(dir = %self.backup_dir.display(), size_bytes, "backup complete");

        Ok(BackupArtifact {
            run_id: self.run_id.clone(),
            repo_name: self.repo_name.clone(),
            dir: self.backup_dir.clone(),
            bundle,
            archive: Some(archive),
            created_at,
            size_bytes,
        })
    }

    fn create_archive(&self, archive: &Path) -> Result<()> {
        let parent = self
            .repo_path
            .parent()
            .ok_or_else(|| anyhow!("repo path has no parent"))?;
        let mut cmd = Command::new("tar");
        cmd.arg("-czf").arg(archive).arg("-C").arg(parent);
        for pattern in ARCHIVE_EXCLUDES {
            cmd.arg(format!("--exclude={pattern}"));
        }
        cmd.arg(&self.repo_name);

        let output = run_command_with_timeout(
            cmd,
            None,
            ARCHIVE_TIMEOUT,
            64 * 1024,
            &CancelToken::new(),
        )
        .context("run tar")?;
        if !output.status.success() {
            return Err(anyhow!(
                "tar failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// Restore `artifact` over `target`, preferring the bundle.
///
/// Atomic at the directory level: the restored tree is materialized in a
/// staging directory first, the current target is parked at
/// `<target>.pre-restore` (replacing any stale parked copy), then the staging
/// directory is moved into place.
#[instrument(skip_all, fields(run_id = %artifact.run_id, target = %target.display()))]
pub fn restore(artifact: &BackupArtifact, target: &Path) -> Result<PathBuf> {
    let parent = target
        .parent()
        .ok_or_else(|| anyhow!("restore target has no parent"))?;
    let name = repo_name(target);
    let staging = parent.join(format!(".{name}.restore-tmp"));
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("clear stale staging {}", staging.display()))?;
    }

    if let Some(bundle) = artifact.bundle.as_deref().filter(|p| p.exists()) {
        Git::clone_from_bundle(bundle, &staging).context("clone from bundle")?;
    } else if let Some(archive) = artifact.archive.as_deref().filter(|p| p.exists()) {
        extract_archive(archive, &staging, &artifact.repo_name)?;
    } else {
        return Err(anyhow!(
            "backup {} has neither bundle nor archive",
            artifact.run_id
        ));
    }

    let parked = parent.join(format!("{name}.pre-restore"));
    if parked.exists() {
        fs::remove_dir_all(&parked)
            .with_context(|| format!("clear stale parked tree {}", parked.display()))?;
    }
    if target.exists() {
        fs::rename(target, &parked)
            .with_context(|| format!("park current tree at {}", parked.display()))?;
    }
    fs::rename(&staging, target)
        .with_context(|| format!("swap restored tree into {}", target.display()))?;

    info!("restore complete");
    Ok(target.to_path_buf())
}

fn extract_archive(archive: &Path, staging: &Path, repo_name: &str) -> Result<()> {
    let extract_dir = staging.with_extension("unpack");
    if extract_dir.exists() {
        fs::remove_dir_all(&extract_dir)
            .with_context(|| format!("clear stale unpack dir {}", extract_dir.display()))?;
    }
    fs::create_dir_all(&extract_dir)
        .with_context(|| format!("create unpack dir {}", extract_dir.display()))?;

    let mut cmd = Command::new("tar");
    cmd.arg("-xzf").arg(archive).arg("-C").arg(&extract_dir);
    let output =
        run_command_with_timeout(cmd, None, ARCHIVE_TIMEOUT, 64 * 1024, &CancelToken::new())
            .context("run tar -x")?;
    if !output.status.success() {
        return Err(anyhow!(
            "tar -x failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let inner = extract_dir.join(repo_name);
    if !inner.is_dir() {
        return Err(anyhow!(
            "archive did not contain expected root '{repo_name}'"
        ));
    }
    fs::rename(&inner, staging).context("move unpacked tree into staging")?;
    fs::remove_dir_all(&extract_dir).ok();
    Ok(())
}

/// Enumerate cached backups, newest first, optionally filtered by repo name.
pub fn list_backups(layout: &CacheLayout, repo: Option<&str>) -> Result<Vec<BackupArtifact>> {
    let backups_dir = layout.backups_dir();
    if !backups_dir.exists() {
        return Ok(Vec::new());
    }

    let mut repo_dirs = Vec::new();
    match repo {
        Some(name) => {
            let dir = backups_dir.join(name);
            if dir.is_dir() {
                repo_dirs.push(dir);
            }
        }
        None => {
            for entry in fs::read_dir(&backups_dir)
                .with_context(|| format!("read {}", backups_dir.display()))?
            {
                let path = entry.context("read backup entry")?.path();
                if path.is_dir() {
                    repo_dirs.push(path);
                }
            }
        }
    }

    let mut backups = Vec::new();
    for repo_dir in repo_dirs {
        for entry in
            fs::read_dir(&repo_dir).with_context(|| format!("read {}", repo_dir.display()))?
        {
            let dir = entry.context("read backup entry")?.path();
            let metadata_path = dir.join(METADATA_FILE);
            if !metadata_path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&metadata_path)
                .with_context(|| format!("read {}", metadata_path.display()))?;
            let Ok(metadata) = serde_json::from_str::<BackupMetadata>(&raw) else {
                continue;
            };

            let bundle = Some(dir.join(BUNDLE_FILE)).filter(|p| p.exists());
            let archive = Some(dir.join(ARCHIVE_FILE)).filter(|p| p.exists());
            let size_bytes = file_size(bundle.as_deref()) + file_size(archive.as_deref());

            backups.push(BackupArtifact {
                run_id: metadata.run_id,
                repo_name: metadata.repo_name,
                dir,
                bundle,
                archive,
                created_at: metadata.created_at,
                size_bytes,
            });
        }
    }

    backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(backups)
}

/// Find a backup by run id.
pub fn find_backup(layout: &CacheLayout, run_id: &str) -> Result<Option<BackupArtifact>> {
    Ok(list_backups(layout, None)?
        .into_iter()
        .find(|b| b.run_id == run_id))
}

fn write_metadata(path: &Path, metadata: &BackupMetadata) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(metadata).context("serialize metadata")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

fn file_size(path: Option<&Path>) -> u64 {
    path.and_then(|p| fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0)
}
