//! Listing and restoring file versions.

use crate::config::ProjectPaths;
use crate::executor::snapshot::{archive_stamp, move_into_archive, parse_archive_name};
use crate::fs::metadata::{files_identical, FileMetadata};
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// Id of the copy in `current/`.
pub const CURRENT_VERSION: &str = "current";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionKind {
    Current,
    Archived,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileVersion {
    /// `current` or the archive file name
    pub id: String,
    pub kind: VersionKind,
    pub path: PathBuf,
    pub size: u64,
    pub at: DateTime<Utc>,
}

fn check_relative(relative: &Path) -> Result<()> {
    let valid = !relative.as_os_str().is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if valid {
        Ok(())
    } else {
        Err(BackupError::InvalidPath(relative.to_path_buf()))
    }
}

/// Current and archived versions of `relative`, newest first.
pub fn list_versions(paths: &ProjectPaths, relative: &Path) -> Result<Vec<FileVersion>> {
    check_relative(relative)?;
    let file_name = relative
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| BackupError::InvalidPath(relative.to_path_buf()))?;

    let mut versions = Vec::new();

    let current = paths.current().join(relative);
    if let Ok(meta) = fs::symlink_metadata(&current) {
        if meta.is_file() {
            versions.push(FileVersion {
                id: CURRENT_VERSION.to_string(),
                kind: VersionKind::Current,
                at: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
                size: meta.len(),
                path: current,
            });
        }
    }

    let archive_parent = match relative.parent() {
        Some(parent) => paths.archived().join(parent),
        None => paths.archived(),
    };
    let mut archived = Vec::new();
    if let Ok(entries) = fs::read_dir(&archive_parent) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some((original, at)) = parse_archive_name(&name) else {
                continue;
            };
            if original != file_name {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            archived.push(FileVersion {
                id: name.clone(),
                kind: VersionKind::Archived,
                path: entry.path(),
                size: meta.len(),
                at,
            });
        }
    }
    // Same-second versions order by their collision suffix
    archived.sort_by(|a, b| b.at.cmp(&a.at).then_with(|| b.id.cmp(&a.id)));
    versions.extend(archived);
    Ok(versions)
}

#[derive(Debug, Clone)]
pub struct RestoreRequest<'a> {
    pub relative: &'a Path,
    /// Version id; the newest when absent
    pub version: Option<&'a str>,
    /// Alternative destination file or directory
    pub to: Option<&'a Path>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestorePlan {
    pub version: FileVersion,
    pub destination: PathBuf,
    /// Destination already holds this content
    pub identical: bool,
    /// Existing destination content is archived before the restore
    pub archive_existing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_to: Option<PathBuf>,
    pub performed: bool,
}

/// Restore one version of a file. Existing destination content is archived
/// first unless it is byte-identical to the chosen version.
pub fn restore(
    paths: &ProjectPaths,
    project_root: &Path,
    request: &RestoreRequest<'_>,
    now: DateTime<Utc>,
    pid: u32,
) -> Result<RestorePlan> {
    let versions = list_versions(paths, request.relative)?;
    let wanted = request.version.unwrap_or(CURRENT_VERSION);
    let version = match request.version {
        Some(id) => versions.into_iter().find(|v| v.id == id),
        None => versions.into_iter().next(),
    }
    .ok_or_else(|| BackupError::VersionNotFound {
        path: request.relative.to_path_buf(),
        version: wanted.to_string(),
    })?;

    let file_name = request
        .relative
        .file_name()
        .ok_or_else(|| BackupError::InvalidPath(request.relative.to_path_buf()))?;
    let to_original = request.to.is_none();
    let destination = match request.to {
        Some(to) if to.is_dir() => to.join(file_name),
        Some(to) => to.to_path_buf(),
        None => project_root.join(request.relative),
    };

    let exists = fs::symlink_metadata(&destination).map(|m| m.is_file()).unwrap_or(false);
    let identical = exists && files_identical(&version.path, &destination)?;
    let mut plan = RestorePlan {
        version,
        archive_existing: exists && !identical,
        destination,
        identical,
        archived_to: None,
        performed: false,
    };
    if request.dry_run || identical {
        return Ok(plan);
    }

    let parent = plan
        .destination
        .parent()
        .ok_or_else(|| BackupError::InvalidPath(plan.destination.clone()))?
        .to_path_buf();
    fs::create_dir_all(&parent)?;

    let staged = tempfile::Builder::new()
        .prefix(".restore-tmp-")
        .tempfile_in(&parent)?;
    fs::copy(&plan.version.path, staged.path())?;
    FileMetadata::from_path(&plan.version.path)?.apply_to_path(staged.path())?;

    if plan.archive_existing {
        // Overwritten project files become versions of the project itself
        let archive_parent = if to_original {
            match request.relative.parent() {
                Some(p) => paths.archived().join(p),
                None => paths.archived(),
            }
        } else {
            parent.clone()
        };
        let archived = move_into_archive(
            &plan.destination,
            &archive_parent,
            &file_name.to_string_lossy(),
            &archive_stamp(now),
            pid,
        )?;
        plan.archived_to = Some(archived);
    }

    staged.persist(&plan.destination).map_err(|e| e.error)?;
    plan.performed = true;
    info!(
        "Restored {} ({}) to {}",
        request.relative.display(),
        plan.version.id,
        plan.destination.display()
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::snapshot::archive_name;
    use chrono::Duration;
    use tempfile::TempDir;

    struct Fixture {
        project: TempDir,
        _backup: TempDir,
        paths: ProjectPaths,
    }

    impl Fixture {
        fn new() -> Self {
            let backup = TempDir::new().unwrap();
            let paths = ProjectPaths::new(backup.path(), "app");
            Self {
                project: TempDir::new().unwrap(),
                _backup: backup,
                paths,
            }
        }

        fn archive(&self, relative: &str, at: DateTime<Utc>, content: &[u8]) -> String {
            let rel = Path::new(relative);
            let name = archive_name(
                &rel.file_name().unwrap().to_string_lossy(),
                &archive_stamp(at),
                1,
                0,
            );
            let dir = match rel.parent() {
                Some(p) => self.paths.archived().join(p),
                None => self.paths.archived(),
            };
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(&name), content).unwrap();
            name
        }

        fn current(&self, relative: &str, content: &[u8]) {
            let path = self.paths.current().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    #[test]
    fn test_versions_newest_first() -> Result<()> {
        let fx = Fixture::new();
        let now = Utc::now();
        fx.current("src/a.txt", b"v3");
        let older = fx.archive("src/a.txt", now - Duration::days(3), b"v1");
        let newer = fx.archive("src/a.txt", now - Duration::days(1), b"v2");
        fx.archive("src/ab.txt", now, b"other file");

        let versions = list_versions(&fx.paths, Path::new("src/a.txt"))?;
        let ids: Vec<&str> = versions.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec![CURRENT_VERSION, newer.as_str(), older.as_str()]);
        assert_eq!(versions[1].kind, VersionKind::Archived);
        Ok(())
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let fx = Fixture::new();
        assert!(matches!(
            list_versions(&fx.paths, Path::new("../etc/passwd")),
            Err(BackupError::InvalidPath(_))
        ));
        assert!(list_versions(&fx.paths, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_restore_archives_existing_content() -> Result<()> {
        let fx = Fixture::new();
        let now = Utc::now();
        let v1 = fx.archive("a.txt", now - Duration::days(1), b"v1");
        fx.current("a.txt", b"v2");
        fs::write(fx.project.path().join("a.txt"), b"local edit")?;

        let request = RestoreRequest {
            relative: Path::new("a.txt"),
            version: Some(v1.as_str()),
            to: None,
            dry_run: false,
        };
        let plan = restore(&fx.paths, fx.project.path(), &request, now, 77)?;
        assert!(plan.performed);
        assert_eq!(fs::read(fx.project.path().join("a.txt"))?, b"v1");

        let archived = plan.archived_to.unwrap();
        assert_eq!(fs::read(&archived)?, b"local edit");
        assert!(archived.starts_with(fx.paths.archived()));
        Ok(())
    }

    #[test]
    fn test_identical_destination_untouched() -> Result<()> {
        let fx = Fixture::new();
        fx.current("a.txt", b"same");
        fs::write(fx.project.path().join("a.txt"), b"same")?;

        let request = RestoreRequest {
            relative: Path::new("a.txt"),
            version: None,
            to: None,
            dry_run: false,
        };
        let plan = restore(&fx.paths, fx.project.path(), &request, Utc::now(), 1)?;
        assert!(plan.identical);
        assert!(!plan.performed);
        assert!(!fx.paths.archived().exists());
        Ok(())
    }

    #[test]
    fn test_dry_run_and_alternate_destination() -> Result<()> {
        let fx = Fixture::new();
        fx.current("cfg/app.toml", b"key = 1");
        let out = TempDir::new()?;

        let mut request = RestoreRequest {
            relative: Path::new("cfg/app.toml"),
            version: None,
            to: Some(out.path()),
            dry_run: true,
        };
        let plan = restore(&fx.paths, fx.project.path(), &request, Utc::now(), 1)?;
        assert!(!plan.performed);
        assert!(!out.path().join("app.toml").exists());

        request.dry_run = false;
        let plan = restore(&fx.paths, fx.project.path(), &request, Utc::now(), 1)?;
        assert!(plan.performed);
        assert_eq!(fs::read(out.path().join("app.toml"))?, b"key = 1");
        Ok(())
    }

    #[test]
    fn test_unknown_version() {
        let fx = Fixture::new();
        fx.current("a.txt", b"x");
        let request = RestoreRequest {
            relative: Path::new("a.txt"),
            version: Some("a.txt.20000101_000000_1"),
            to: None,
            dry_run: false,
        };
        assert!(matches!(
            restore(&fx.paths, fx.project.path(), &request, Utc::now(), 1),
            Err(BackupError::VersionNotFound { .. })
        ));
    }
}
