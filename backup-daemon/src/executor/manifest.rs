//! Per-cycle backup manifest.
//!
//! A manifest records every file in the project's `current/` tree with its
//! size and mtime, plus the database snapshots taken during the cycle. It is
//! written atomically as `manifest.json` and is the only record the cloud
//! sync and external viewers read; the next cycle diffs against it to find
//! deletions and to reuse content hashes.

use crate::database::engine::Engine;
use crate::fs::changes::DetectionStrategy;
use crate::fs::critical::CriticalFiles;
use crate::fs::metadata::sha256_file;
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::atomic::{read_json, write_json_atomic};
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const MANIFEST_VERSION: u32 = 1;

/// Terminal state of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    /// Completed with per-file or per-database failures
    Partial,
    Failed,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Failed => "failed",
        })
    }
}

/// Backup manifest, serialized as `manifest.json` in the project's backup root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub project: String,
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub files: Vec<FileEntry>,
    pub databases: Vec<DatabaseEntry>,
    pub totals: Totals,
    pub changes: ChangeSummary,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    /// Policy skips (symlinks, oversized files)
    #[serde(default)]
    pub warnings: Vec<ErrorRecord>,
}

/// Metadata for a single file in `current/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to `current/`
    pub path: String,
    pub size: u64,
    /// Modification time of the current copy (seconds since epoch)
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// One database snapshot taken this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub name: String,
    pub engine: Engine,
    /// Path of the compressed dump relative to the project's backup root
    pub path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<u64>,
    pub verified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub files: usize,
    pub bytes: u64,
    pub critical_files: usize,
    pub databases: usize,
    pub database_bytes: u64,
}

/// What this cycle did to the snapshot tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub strategy: DetectionStrategy,
    pub first_cycle: bool,
    pub copied: usize,
    pub archived: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Default for ChangeSummary {
    fn default() -> Self {
        Self {
            strategy: DetectionStrategy::Full,
            first_cycle: false,
            copied: 0,
            archived: 0,
            deleted: 0,
            unchanged: 0,
            skipped: 0,
            failed: 0,
        }
    }
}

/// Accumulated non-fatal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ErrorRecord {
    pub fn from_error(error: &BackupError) -> Self {
        let path = match error {
            BackupError::FileCopy { path, .. }
            | BackupError::SymlinkSkipped(path)
            | BackupError::FileTooLarge { path, .. }
            | BackupError::Verification { path, .. } => Some(path.to_string_lossy().to_string()),
            _ => None,
        };
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            path,
        }
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Entry lookup by relative path
    pub fn file_map(&self) -> HashMap<&str, &FileEntry> {
        self.files.iter().map(|f| (f.path.as_str(), f)).collect()
    }

    /// Absolute path of a database dump
    pub fn database_path(&self, backup_root: &Path, entry: &DatabaseEntry) -> PathBuf {
        backup_root.join(&entry.path)
    }

    #[cfg(test)]
    pub(crate) fn for_test(files: Vec<FileEntry>) -> Self {
        let now = Utc::now();
        let totals = Totals {
            files: files.len(),
            bytes: files.iter().map(|f| f.size).sum(),
            ..Totals::default()
        };
        Self {
            version: MANIFEST_VERSION,
            project: "test".to_string(),
            cycle_id: "test".to_string(),
            started_at: now,
            completed_at: now,
            outcome: Outcome::Success,
            files,
            databases: Vec::new(),
            totals,
            changes: ChangeSummary::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Assembles a manifest from the finished snapshot tree.
pub struct ManifestBuilder<'a> {
    project: String,
    cycle_id: String,
    started_at: DateTime<Utc>,
    critical: &'a CriticalFiles,
    previous: Option<&'a Manifest>,
    hash_files: bool,
    databases: Vec<DatabaseEntry>,
    changes: ChangeSummary,
    errors: Vec<ErrorRecord>,
    warnings: Vec<ErrorRecord>,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(
        project: impl Into<String>,
        cycle_id: impl Into<String>,
        started_at: DateTime<Utc>,
        critical: &'a CriticalFiles,
    ) -> Self {
        Self {
            project: project.into(),
            cycle_id: cycle_id.into(),
            started_at,
            critical,
            previous: None,
            hash_files: false,
            databases: Vec::new(),
            changes: ChangeSummary::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Reuse hashes from the previous manifest for unchanged copies.
    pub fn previous(mut self, previous: Option<&'a Manifest>) -> Self {
        self.previous = previous;
        self
    }

    /// Record a sha256 per file.
    pub fn hash_files(mut self, enabled: bool) -> Self {
        self.hash_files = enabled;
        self
    }

    pub fn databases(mut self, databases: Vec<DatabaseEntry>) -> Self {
        self.databases = databases;
        self
    }

    pub fn changes(mut self, changes: ChangeSummary) -> Self {
        self.changes = changes;
        self
    }

    pub fn errors(mut self, errors: Vec<ErrorRecord>) -> Self {
        self.errors = errors;
        self
    }

    pub fn warnings(mut self, warnings: Vec<ErrorRecord>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Walk `current_dir` and produce the manifest. Every listed file exists
    /// in the tree with the recorded size at the time of the walk.
    pub fn build(self, current_dir: &Path, outcome: Outcome) -> Result<Manifest> {
        let previous = self.previous.map(|m| m.file_map()).unwrap_or_default();

        let mut files = Vec::new();
        if current_dir.exists() {
            for file in walk_directory(current_dir, &WalkOptions::unfiltered())? {
                if file.is_symlink {
                    continue;
                }
                let path = file.relative_path.to_string_lossy().to_string();
                let modified = file
                    .modified
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or_default();

                let sha256 = if self.hash_files {
                    match previous.get(path.as_str()) {
                        Some(prev) if prev.size == file.size && prev.modified == modified && prev.sha256.is_some() => {
                            prev.sha256.clone()
                        }
                        _ => Some(sha256_file(&file.path)?),
                    }
                } else {
                    None
                };

                files.push(FileEntry {
                    critical: self.critical.is_critical(&file.relative_path),
                    path,
                    size: file.size,
                    modified,
                    sha256,
                });
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let totals = Totals {
            files: files.len(),
            bytes: files.iter().map(|f| f.size).sum(),
            critical_files: files.iter().filter(|f| f.critical).count(),
            databases: self.databases.len(),
            database_bytes: self.databases.iter().map(|d| d.size).sum(),
        };

        Ok(Manifest {
            version: MANIFEST_VERSION,
            project: self.project,
            cycle_id: self.cycle_id,
            started_at: self.started_at,
            completed_at: Utc::now(),
            outcome,
            files,
            databases: self.databases,
            totals,
            changes: self.changes,
            errors: self.errors,
            warnings: self.warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn critical() -> CriticalFiles {
        CriticalFiles::new(&[]).unwrap()
    }

    #[test]
    fn test_build_lists_current_tree() -> Result<()> {
        let dir = TempDir::new()?;
        let current = dir.path().join("current");
        fs::create_dir_all(current.join("src"))?;
        fs::write(current.join("src/main.rs"), b"fn main() {}")?;
        fs::write(current.join(".env"), b"KEY=1")?;

        let critical = critical();
        let manifest = ManifestBuilder::new("app", "c1", Utc::now(), &critical).build(&current, Outcome::Success)?;

        assert_eq!(manifest.totals.files, 2);
        assert_eq!(manifest.totals.bytes, 17);
        assert_eq!(manifest.totals.critical_files, 1);
        for entry in &manifest.files {
            let on_disk = fs::metadata(current.join(&entry.path))?;
            assert_eq!(on_disk.len(), entry.size);
        }
        assert!(manifest.files.iter().all(|f| f.sha256.is_none()));
        Ok(())
    }

    #[test]
    fn test_missing_current_is_empty_manifest() -> Result<()> {
        let dir = TempDir::new()?;
        let critical = critical();
        let manifest = ManifestBuilder::new("app", "c1", Utc::now(), &critical)
            .build(&dir.path().join("current"), Outcome::Failed)?;
        assert_eq!(manifest.totals.files, 0);
        assert_eq!(manifest.outcome, Outcome::Failed);
        Ok(())
    }

    #[test]
    fn test_hashes_reused_for_unchanged_copies() -> Result<()> {
        let dir = TempDir::new()?;
        let current = dir.path().join("current");
        fs::create_dir_all(&current)?;
        fs::write(current.join("a.txt"), b"abc")?;

        let critical = critical();
        let first = ManifestBuilder::new("app", "c1", Utc::now(), &critical)
            .hash_files(true)
            .build(&current, Outcome::Success)?;
        assert_eq!(
            first.files[0].sha256.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );

        // A stale hash is kept when size and mtime match, proving no rehash
        let mut doctored = first.clone();
        doctored.files[0].sha256 = Some("cached".to_string());
        let second = ManifestBuilder::new("app", "c2", Utc::now(), &critical)
            .hash_files(true)
            .previous(Some(&doctored))
            .build(&current, Outcome::Success)?;
        assert_eq!(second.files[0].sha256.as_deref(), Some("cached"));
        Ok(())
    }

    #[test]
    fn test_write_and_load() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("manifest.json");
        assert!(Manifest::load(&path)?.is_none());

        let mut manifest = Manifest::for_test(vec![FileEntry {
            path: "a.txt".into(),
            size: 1,
            modified: 0,
            critical: false,
            sha256: None,
        }]);
        manifest.databases.push(DatabaseEntry {
            name: "app.db".into(),
            engine: Engine::Sqlite,
            path: "databases/app.db.20260101_000000.sqlite.zst".into(),
            size: 10,
            tables: Some(3),
            verified: true,
        });
        manifest.write(&path)?;

        let loaded = Manifest::load(&path)?.unwrap();
        assert_eq!(loaded.files, manifest.files);
        assert_eq!(loaded.databases, manifest.databases);

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(raw["totals"]["files"], 1);
        assert_eq!(raw["databases"][0]["engine"], "sqlite");
        Ok(())
    }

    #[test]
    fn test_error_record_carries_path() {
        let error = BackupError::FileTooLarge {
            path: PathBuf::from("big.bin"),
            size: 10,
            limit: 5,
        };
        let record = ErrorRecord::from_error(&error);
        assert_eq!(record.kind, "file_too_large");
        assert_eq!(record.path.as_deref(), Some("big.bin"));
    }
}
