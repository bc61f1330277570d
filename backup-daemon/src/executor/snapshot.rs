//! Snapshot engine.
//!
//! Materializes a change set into the project's `current/` tree. A changed
//! file is first copied next to its destination under a temporary name; only
//! then is the superseded copy moved into `archived/` and the new one renamed
//! into place, so a failed copy never leaves a path without its last good
//! version.
//!
//! Archive names are `<file>.<YYYYMMDD_HHMMSS>_<pid>` with a numeric suffix
//! appended on collision. An archived version is never overwritten.

use crate::fs::metadata::{files_identical, FileMetadata};
use crate::executor::manifest::ErrorRecord;
use crate::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Total permits for concurrent copies.
const CONCURRENCY_BUDGET: u32 = 16;

/// Timestamp format embedded in archive names.
pub const ARCHIVE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Permits a copy takes based on file size. Many small files copy in
/// parallel; large ones serialize to avoid thrashing the destination disk.
fn concurrency_weight(file_size: u64) -> u32 {
    match file_size {
        0..=10_485_759 => 1,                // < 10 MB
        10_485_760..=104_857_599 => 2,      // 10 - 100 MB
        104_857_600..=1_073_741_823 => 8,   // 100 MB - 1 GB
        _ => CONCURRENCY_BUDGET,            // > 1 GB
    }
}

pub fn archive_stamp(at: DateTime<Utc>) -> String {
    at.format(ARCHIVE_STAMP_FORMAT).to_string()
}

/// `<file>.<stamp>_<pid>` plus `_<n>` when `n > 0`.
pub fn archive_name(file_name: &str, stamp: &str, pid: u32, n: u32) -> String {
    if n == 0 {
        format!("{file_name}.{stamp}_{pid}")
    } else {
        format!("{file_name}.{stamp}_{pid}_{n}")
    }
}

/// Split an archive file name into the original name and its timestamp.
pub fn parse_archive_name(name: &str) -> Option<(&str, DateTime<Utc>)> {
    // <original>.<YYYYMMDD>_<HHMMSS>_<pid>[_n]
    let (original, suffix) = name.rsplit_once('.')?;
    let mut parts = suffix.split('_');
    let date = parts.next()?;
    let time = parts.next()?;
    let pid = parts.next()?;
    if date.len() != 8 || time.len() != 6 || pid.parse::<u32>().is_err() {
        return None;
    }
    let stamp = NaiveDateTime::parse_from_str(&format!("{date}_{time}"), ARCHIVE_STAMP_FORMAT).ok()?;
    Some((original, stamp.and_utc()))
}

/// Timestamp of any '.'-separated segment shaped `<stamp>_<pid>[_n]`.
/// Database dumps carry their stamp before the extensions.
pub fn find_stamp(name: &str) -> Option<DateTime<Utc>> {
    name.split('.').rev().find_map(|segment| {
        let mut parts = segment.split('_');
        let date = parts.next()?;
        let time = parts.next()?;
        parts.next()?.parse::<u32>().ok()?;
        if date.len() != 8 || time.len() != 6 {
            return None;
        }
        NaiveDateTime::parse_from_str(&format!("{date}_{time}"), ARCHIVE_STAMP_FORMAT)
            .ok()
            .map(|t| t.and_utc())
    })
}

#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    pub max_file_size: u64,
    pub allow_large_files: bool,
}

/// Outcome of materializing one change set.
#[derive(Debug, Default)]
pub struct SnapshotReport {
    pub copied: usize,
    pub archived: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Per-file failures
    pub errors: Vec<ErrorRecord>,
    /// Policy skips
    pub warnings: Vec<ErrorRecord>,
    /// Archive paths created this run
    pub archived_versions: Vec<PathBuf>,
}

enum FileOutcome {
    Copied { archived: Option<PathBuf> },
    Unchanged,
    Vanished,
    Skipped(BackupError),
    Failed(BackupError),
}

/// Copies changed files of one project into its snapshot tree.
#[derive(Debug, Clone)]
pub struct SnapshotEngine {
    source_root: PathBuf,
    current_dir: PathBuf,
    archive_dir: PathBuf,
    stamp: String,
    pid: u32,
    options: SnapshotOptions,
}

impl SnapshotEngine {
    pub fn new(
        source_root: impl Into<PathBuf>,
        current_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        started_at: DateTime<Utc>,
        pid: u32,
        options: SnapshotOptions,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            current_dir: current_dir.into(),
            archive_dir: archive_dir.into(),
            stamp: archive_stamp(started_at),
            pid,
            options,
        }
    }

    /// Copy `changed` and archive `deleted`. `on_file` is called with the
    /// running count of processed paths.
    ///
    /// Per-file failures are collected. Fails with `NoOutput` when files
    /// were attempted and not a single one could be written.
    pub async fn run<F>(
        self: Arc<Self>,
        changed: BTreeSet<PathBuf>,
        deleted: &BTreeSet<PathBuf>,
        on_file: F,
    ) -> Result<SnapshotReport>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        fs::create_dir_all(&self.current_dir)?;

        let mut report = SnapshotReport::default();
        let on_file = Arc::new(on_file);
        let processed = Arc::new(AtomicUsize::new(0));
        let semaphore = Arc::new(Semaphore::new(CONCURRENCY_BUDGET as usize));

        // Smallest first so the bulk of small files clears quickly
        let mut queue: Vec<(PathBuf, u64)> = changed
            .into_iter()
            .map(|rel| {
                let size = fs::symlink_metadata(self.source_root.join(&rel))
                    .map(|m| m.len())
                    .unwrap_or(0);
                (rel, size)
            })
            .collect();
        queue.sort_by_key(|(_, size)| *size);

        let mut handles = Vec::with_capacity(queue.len());
        for (relative, size) in queue {
            let engine = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let processed = Arc::clone(&processed);
            let on_file = Arc::clone(&on_file);

            handles.push(tokio::spawn(async move {
                let permit = semaphore
                    .acquire_many_owned(concurrency_weight(size))
                    .await
                    .map_err(|e| io::Error::other(format!("semaphore closed: {e}")))?;
                let rel = relative.clone();
                let outcome = tokio::task::spawn_blocking(move || engine.snapshot_file(&rel))
                    .await
                    .map_err(|e| io::Error::other(format!("copy task failed: {e}")))?;
                drop(permit);
                on_file(processed.fetch_add(1, Ordering::Relaxed) + 1);
                Ok::<_, io::Error>((relative, outcome))
            }));
        }

        let mut attempted = 0usize;
        for handle in handles {
            let (relative, outcome) = match handle.await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    report.failed += 1;
                    attempted += 1;
                    report.errors.push(ErrorRecord::from_error(&BackupError::Io(e)));
                    continue;
                }
                Err(e) => {
                    report.failed += 1;
                    attempted += 1;
                    warn!("Snapshot task panicked: {}", e);
                    continue;
                }
            };

            match outcome {
                FileOutcome::Copied { archived } => {
                    attempted += 1;
                    report.copied += 1;
                    if let Some(path) = archived {
                        report.archived += 1;
                        report.archived_versions.push(path);
                    }
                }
                FileOutcome::Unchanged => report.unchanged += 1,
                FileOutcome::Vanished => debug!("{} vanished before copy", relative.display()),
                FileOutcome::Skipped(reason) => {
                    warn!("{}", reason);
                    report.skipped += 1;
                    report.warnings.push(ErrorRecord::from_error(&reason));
                }
                FileOutcome::Failed(error) => {
                    warn!("{}", error);
                    attempted += 1;
                    report.failed += 1;
                    report.errors.push(ErrorRecord::from_error(&error));
                }
            }
        }

        for relative in deleted {
            match self.archive_deleted(relative) {
                Ok(Some(path)) => {
                    report.deleted += 1;
                    report.archived += 1;
                    report.archived_versions.push(path);
                }
                Ok(None) => {}
                Err(e) => {
                    let error = BackupError::FileCopy {
                        path: relative.clone(),
                        source: e,
                    };
                    warn!("{}", error);
                    report.failed += 1;
                    report.errors.push(ErrorRecord::from_error(&error));
                }
            }
            on_file(processed.fetch_add(1, Ordering::Relaxed) + 1);
        }

        if attempted > 0 && report.copied == 0 && report.failed >= attempted {
            return Err(BackupError::NoOutput { failed: report.failed });
        }

        info!(
            copied = report.copied,
            archived = report.archived,
            deleted = report.deleted,
            unchanged = report.unchanged,
            skipped = report.skipped,
            failed = report.failed,
            "Snapshot complete"
        );
        Ok(report)
    }

    fn snapshot_file(&self, relative: &Path) -> FileOutcome {
        let source = self.source_root.join(relative);
        let metadata = match fs::symlink_metadata(&source) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return FileOutcome::Vanished,
            Err(e) => {
                return FileOutcome::Failed(BackupError::FileCopy {
                    path: relative.to_path_buf(),
                    source: e,
                })
            }
        };

        if metadata.file_type().is_symlink() {
            return FileOutcome::Skipped(BackupError::SymlinkSkipped(relative.to_path_buf()));
        }
        if !metadata.is_file() {
            return FileOutcome::Vanished;
        }
        if metadata.len() > self.options.max_file_size && !self.options.allow_large_files {
            return FileOutcome::Skipped(BackupError::FileTooLarge {
                path: relative.to_path_buf(),
                size: metadata.len(),
                limit: self.options.max_file_size,
            });
        }

        match self.copy_into_current(&source, relative) {
            Ok(Some(archived)) => FileOutcome::Copied { archived },
            Ok(None) => FileOutcome::Unchanged,
            Err(e) => FileOutcome::Failed(BackupError::FileCopy {
                path: relative.to_path_buf(),
                source: e,
            }),
        }
    }

    /// `Ok(None)` when the current copy already has identical content.
    fn copy_into_current(&self, source: &Path, relative: &Path) -> io::Result<Option<Option<PathBuf>>> {
        let destination = self.current_dir.join(relative);
        let exists = destination.symlink_metadata().is_ok();

        if exists && files_identical(source, &destination)? {
            return Ok(None);
        }

        let parent = destination
            .parent()
            .ok_or_else(|| io::Error::other("destination has no parent"))?;
        fs::create_dir_all(parent)?;

        let staged = tempfile::Builder::new()
            .prefix(".backup-tmp-")
            .tempfile_in(parent)?;
        fs::copy(source, staged.path())?;
        FileMetadata::from_path(source)?.apply_to_path(staged.path())?;

        let archived = if exists {
            Some(self.move_to_archive(&destination, relative)?)
        } else {
            None
        };

        staged.persist(&destination).map_err(|e| e.error)?;
        Ok(Some(archived))
    }

    fn archive_deleted(&self, relative: &Path) -> io::Result<Option<PathBuf>> {
        let current = self.current_dir.join(relative);
        if current.symlink_metadata().is_err() {
            return Ok(None);
        }
        let archived = self.move_to_archive(&current, relative)?;
        prune_empty_parents(&current, &self.current_dir);
        Ok(Some(archived))
    }

    /// Move `path` into the archive tree under a fresh name.
    fn move_to_archive(&self, path: &Path, relative: &Path) -> io::Result<PathBuf> {
        let file_name = relative
            .file_name()
            .ok_or_else(|| io::Error::other("path has no file name"))?
            .to_string_lossy()
            .to_string();
        let archive_parent = match relative.parent() {
            Some(parent) => self.archive_dir.join(parent),
            None => self.archive_dir.clone(),
        };
        let target = move_into_archive(path, &archive_parent, &file_name, &self.stamp, self.pid)?;
        debug!("Archived {} -> {}", relative.display(), target.display());
        Ok(target)
    }
}

/// Move `path` into `archive_parent` as `<file_name>.<stamp>_<pid>[_n]`,
/// picking the first name not already taken.
pub fn move_into_archive(
    path: &Path,
    archive_parent: &Path,
    file_name: &str,
    stamp: &str,
    pid: u32,
) -> io::Result<PathBuf> {
    fs::create_dir_all(archive_parent)?;

    let mut n = 0;
    loop {
        let target = archive_parent.join(archive_name(file_name, stamp, pid, n));
        if target.symlink_metadata().is_ok() {
            n += 1;
            continue;
        }
        // Hard link + unlink never replaces an existing archive entry
        match fs::hard_link(path, &target) {
            Ok(()) => fs::remove_file(path)?,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                n += 1;
                continue;
            }
            // Filesystems without hard links (exFAT drives); the project
            // lock keeps other writers out of this tree
            Err(_) => fs::rename(path, &target)?,
        }
        return Ok(target);
    }
}

/// Remove empty directories between `path` and `stop` (exclusive).
pub fn prune_empty_parents(path: &Path, stop: &Path) {
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == stop || !current.starts_with(stop) {
            break;
        }
        if fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        source: TempDir,
        backup: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                source: TempDir::new().unwrap(),
                backup: TempDir::new().unwrap(),
            }
        }

        fn engine(&self, max_file_size: u64) -> Arc<SnapshotEngine> {
            Arc::new(SnapshotEngine::new(
                self.source.path(),
                self.backup.path().join("current"),
                self.backup.path().join("archived"),
                Utc::now(),
                std::process::id(),
                SnapshotOptions {
                    max_file_size,
                    allow_large_files: false,
                },
            ))
        }

        fn archived_files(&self) -> Vec<PathBuf> {
            let dir = self.backup.path().join("archived");
            if !dir.exists() {
                return Vec::new();
            }
            walkdir::WalkDir::new(dir)
                .into_iter()
                .flatten()
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect()
        }
    }

    fn set(paths: &[&str]) -> BTreeSet<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_archive_name_round_trip() {
        let at = NaiveDateTime::parse_from_str("20260317_142501", ARCHIVE_STAMP_FORMAT)
            .unwrap()
            .and_utc();
        let name = archive_name("app.config.json", &archive_stamp(at), 4242, 0);
        assert_eq!(name, "app.config.json.20260317_142501_4242");
        assert_eq!(parse_archive_name(&name), Some(("app.config.json", at)));

        let name = archive_name(".env", &archive_stamp(at), 7, 2);
        assert_eq!(parse_archive_name(&name), Some((".env", at)));
        assert_eq!(parse_archive_name("notes.txt"), None);
    }

    #[test]
    fn test_find_stamp_in_dump_names() {
        let at = NaiveDateTime::parse_from_str("20260101_000102", ARCHIVE_STAMP_FORMAT)
            .unwrap()
            .and_utc();
        assert_eq!(find_stamp("app.db.20260101_000102_99.sqlite.zst"), Some(at));
        assert_eq!(find_stamp("notes.txt.20260101_000102_99_3"), Some(at));
        assert_eq!(find_stamp("report_2026.txt"), None);
    }

    #[tokio::test]
    async fn test_first_copy_then_edit_archives_prior_content() -> Result<()> {
        let fx = Fixture::new();
        let file = fx.source.path().join("a.txt");
        fs::write(&file, b"v1")?;

        let report = fx.engine(1024).run(set(&["a.txt"]), &BTreeSet::new(), |_| {}).await?;
        assert_eq!(report.copied, 1);
        assert_eq!(report.archived, 0);

        fs::write(&file, b"v2")?;
        let report = fx.engine(1024).run(set(&["a.txt"]), &BTreeSet::new(), |_| {}).await?;
        assert_eq!(report.archived, 1);

        let archived = fx.archived_files();
        assert_eq!(archived.len(), 1);
        assert_eq!(fs::read(&archived[0])?, b"v1");
        assert_eq!(fs::read(fx.backup.path().join("current/a.txt"))?, b"v2");
        Ok(())
    }

    #[tokio::test]
    async fn test_identical_content_not_archived() -> Result<()> {
        let fx = Fixture::new();
        fs::write(fx.source.path().join("a.txt"), b"same")?;
        fx.engine(1024).run(set(&["a.txt"]), &BTreeSet::new(), |_| {}).await?;

        let report = fx.engine(1024).run(set(&["a.txt"]), &BTreeSet::new(), |_| {}).await?;
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.archived, 0);
        assert!(fx.archived_files().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_same_second_runs_never_collide() -> Result<()> {
        let fx = Fixture::new();
        let file = fx.source.path().join("a.txt");
        let engine = fx.engine(1024);
        for version in 0..4 {
            fs::write(&file, format!("v{version}"))?;
            Arc::clone(&engine).run(set(&["a.txt"]), &BTreeSet::new(), |_| {}).await?;
        }

        let mut contents: Vec<Vec<u8>> = fx
            .archived_files()
            .iter()
            .map(|p| fs::read(p).unwrap())
            .collect();
        contents.sort();
        assert_eq!(contents, vec![b"v0".to_vec(), b"v1".to_vec(), b"v2".to_vec()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_large_file_skipped() -> Result<()> {
        let fx = Fixture::new();
        fs::write(fx.source.path().join("big.bin"), vec![0u8; 64])?;
        fs::write(fx.source.path().join("small.txt"), b"ok")?;

        let report = fx
            .engine(16)
            .run(set(&["big.bin", "small.txt"]), &BTreeSet::new(), |_| {})
            .await?;
        assert_eq!(report.copied, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.warnings[0].kind, "file_too_large");
        assert!(!fx.backup.path().join("current/big.bin").exists());
        Ok(())
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlink_skipped() -> Result<()> {
        let fx = Fixture::new();
        fs::write(fx.source.path().join("real.txt"), b"x")?;
        std::os::unix::fs::symlink("/etc/passwd", fx.source.path().join("link"))?;

        let report = fx
            .engine(1024)
            .run(set(&["real.txt", "link"]), &BTreeSet::new(), |_| {})
            .await?;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.warnings[0].kind, "symlink_skipped");
        assert!(fx.backup.path().join("current/link").symlink_metadata().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_deleted_file_archived_and_removed() -> Result<()> {
        let fx = Fixture::new();
        fs::create_dir(fx.source.path().join("docs"))?;
        fs::write(fx.source.path().join("docs/old.md"), b"old")?;
        fx.engine(1024).run(set(&["docs/old.md"]), &BTreeSet::new(), |_| {}).await?;

        fs::remove_file(fx.source.path().join("docs/old.md"))?;
        let report = fx
            .engine(1024)
            .run(BTreeSet::new(), &set(&["docs/old.md"]), |_| {})
            .await?;
        assert_eq!(report.deleted, 1);
        assert!(!fx.backup.path().join("current/docs").exists());
        let archived = fx.archived_files();
        assert_eq!(archived.len(), 1);
        assert_eq!(fs::read(&archived[0])?, b"old");
        Ok(())
    }

    #[tokio::test]
    async fn test_vanished_file_is_not_a_failure() -> Result<()> {
        let fx = Fixture::new();
        let report = fx.engine(1024).run(set(&["ghost.txt"]), &BTreeSet::new(), |_| {}).await?;
        assert_eq!(report.failed, 0);
        assert_eq!(report.copied, 0);
        Ok(())
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_all_copies_failing_is_no_output() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let fx = Fixture::new();
        let file = fx.source.path().join("locked.txt");
        fs::write(&file, b"x")?;
        fs::set_permissions(&file, fs::Permissions::from_mode(0o000))?;
        if fs::read(&file).is_ok() {
            // Running as root; permissions are not enforced
            return Ok(());
        }

        let result = fx.engine(1024).run(set(&["locked.txt"]), &BTreeSet::new(), |_| {}).await;
        assert!(matches!(result, Err(BackupError::NoOutput { failed: 1 })));
        Ok(())
    }

    #[tokio::test]
    async fn test_progress_callback_counts_every_path() -> Result<()> {
        let fx = Fixture::new();
        for name in ["a", "b", "c"] {
            fs::write(fx.source.path().join(name), name)?;
        }
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        fx.engine(1024)
            .run(set(&["a", "b", "c"]), &BTreeSet::new(), move |n| {
                seen_cb.fetch_max(n, Ordering::Relaxed);
            })
            .await?;
        assert_eq!(seen.load(Ordering::Relaxed), 3);
        Ok(())
    }
}
