//! Retention cleanup for archived file versions and database dumps.
//!
//! Ages come from the timestamp embedded in each name, falling back to the
//! file's mtime. The newest dump of every database is always kept, however
//! old, so a project whose databases stopped changing still has one.

use crate::config::{ProjectPaths, RetentionConfig};
use crate::executor::snapshot::{find_stamp, parse_archive_name, prune_empty_parents};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Default, Clone, Serialize)]
pub struct RetentionReport {
    pub archived_removed: usize,
    pub databases_removed: usize,
    pub bytes_freed: u64,
    pub dry_run: bool,
    /// Paths removed (or that would be, in a dry run)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<PathBuf>,
}

impl RetentionReport {
    pub fn total_removed(&self) -> usize {
        self.archived_removed + self.databases_removed
    }
}

struct Aged {
    path: PathBuf,
    size: u64,
    at: DateTime<Utc>,
}

fn mtime(meta: &fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

fn archived_versions(dir: &Path) -> Vec<Aged> {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            let name = e.file_name().to_string_lossy();
            let at = parse_archive_name(&name)
                .map(|(_, at)| at)
                .or_else(|| mtime(&meta))?;
            Some(Aged {
                path: e.into_path(),
                size: meta.len(),
                at,
            })
        })
        .collect()
}

fn database_dumps(dir: &Path) -> Vec<(String, Aged)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let name = e.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                return None;
            }
            let at = find_stamp(&name).or_else(|| mtime(&meta))?;
            let database = name.split('.').next().unwrap_or(&name).to_string();
            Some((
                database,
                Aged {
                    path: e.path(),
                    size: meta.len(),
                    at,
                },
            ))
        })
        .collect()
}

/// Remove archived versions older than `file_days` and database dumps older
/// than `database_days`. With `dry_run` nothing is deleted.
pub fn cleanup(
    paths: &ProjectPaths,
    retention: RetentionConfig,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<RetentionReport> {
    let mut report = RetentionReport {
        dry_run,
        ..Default::default()
    };

    let archive_dir = paths.archived();
    let file_cutoff = now - Duration::days(retention.file_days as i64);
    for version in archived_versions(&archive_dir) {
        if version.at >= file_cutoff {
            continue;
        }
        if remove(&version, dry_run, &archive_dir) {
            report.archived_removed += 1;
            report.bytes_freed += version.size;
            report.removed.push(version.path);
        }
    }

    let db_dir = paths.databases();
    let db_cutoff = now - Duration::days(retention.database_days as i64);
    let mut by_database: HashMap<String, Vec<Aged>> = HashMap::new();
    for (database, dump) in database_dumps(&db_dir) {
        by_database.entry(database).or_default().push(dump);
    }
    for (database, mut dumps) in by_database {
        dumps.sort_by(|a, b| b.at.cmp(&a.at));
        for dump in dumps.into_iter().skip(1) {
            if dump.at >= db_cutoff {
                continue;
            }
            if remove(&dump, dry_run, &db_dir) {
                debug!(database = %database, "Expired dump {}", dump.path.display());
                report.databases_removed += 1;
                report.bytes_freed += dump.size;
                report.removed.push(dump.path);
            }
        }
    }

    if report.total_removed() > 0 {
        info!(
            archived = report.archived_removed,
            databases = report.databases_removed,
            bytes = report.bytes_freed,
            dry_run,
            "Retention cleanup"
        );
    }
    Ok(report)
}

fn remove(item: &Aged, dry_run: bool, stop: &Path) -> bool {
    if dry_run {
        return true;
    }
    match fs::remove_file(&item.path) {
        Ok(()) => {
            prune_empty_parents(&item.path, stop);
            true
        }
        Err(e) => {
            warn!("Cannot remove {}: {}", item.path.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::snapshot::{archive_name, archive_stamp};
    use tempfile::TempDir;

    fn policy() -> RetentionConfig {
        RetentionConfig {
            database_days: 7,
            file_days: 30,
        }
    }

    fn write(path: &Path, data: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn test_expired_versions_removed() -> Result<()> {
        let dir = TempDir::new()?;
        let paths = ProjectPaths::new(dir.path(), "app");
        let now = Utc::now();

        let old = archive_name("a.txt", &archive_stamp(now - Duration::days(45)), 1, 0);
        let fresh = archive_name("a.txt", &archive_stamp(now - Duration::days(2)), 1, 0);
        write(&paths.archived().join("src").join(&old), b"old");
        write(&paths.archived().join(&fresh), b"fresh");

        let report = cleanup(&paths, policy(), now, false)?;
        assert_eq!(report.archived_removed, 1);
        assert_eq!(report.bytes_freed, 3);
        assert!(!paths.archived().join("src").exists());
        assert!(paths.archived().join(&fresh).exists());
        Ok(())
    }

    #[test]
    fn test_dry_run_keeps_files() -> Result<()> {
        let dir = TempDir::new()?;
        let paths = ProjectPaths::new(dir.path(), "app");
        let now = Utc::now();
        let old = archive_name("a.txt", &archive_stamp(now - Duration::days(90)), 1, 0);
        write(&paths.archived().join(&old), b"old");

        let report = cleanup(&paths, policy(), now, true)?;
        assert_eq!(report.archived_removed, 1);
        assert!(report.dry_run);
        assert!(paths.archived().join(&old).exists());
        Ok(())
    }

    #[test]
    fn test_newest_dump_always_kept() -> Result<()> {
        let dir = TempDir::new()?;
        let paths = ProjectPaths::new(dir.path(), "app");
        let now = Utc::now();

        let dump = |days: i64, name: &str| {
            let stamp = archive_stamp(now - Duration::days(days));
            paths.databases().join(format!("{name}.{stamp}_10.sqlite.zst"))
        };
        write(&dump(40, "app_db"), b"x");
        write(&dump(20, "app_db"), b"x");
        write(&dump(1, "app_db"), b"x");
        write(&dump(60, "cache_db"), b"only");

        let report = cleanup(&paths, policy(), now, false)?;
        assert_eq!(report.databases_removed, 2);
        assert!(dump(1, "app_db").exists());
        assert!(dump(60, "cache_db").exists());
        Ok(())
    }
}
