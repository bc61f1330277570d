//! Per-project exclusive locks.
//!
//! A lock is a file `<locks_dir>/<name>.lock` holding the holder's pid and
//! acquisition time. It is created by hard-linking a fully written temp
//! file into place: `link(2)` fails with `EEXIST` when the lock exists, so
//! two concurrent acquirers can never both succeed and nobody ever sees a
//! half-written lock.
//!
//! A lock whose holder pid is no longer running is stale. It is reclaimed by
//! renaming it aside first, so two processes racing to reclaim the same stale
//! lock cannot delete each other's fresh lock.

use crate::utils::process::is_process_running;
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockMeta {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }
}

/// Grants exclusive execution rights per project.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

/// Held lock. Released explicitly or when dropped.
#[derive(Debug)]
pub struct LockHandle {
    name: String,
    path: PathBuf,
    meta: LockMeta,
    released: bool,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    /// Acquire the lock for `name`.
    ///
    /// Fails with `LockHeld` when a running process holds it. A stale lock is
    /// reclaimed and acquisition retried once.
    pub fn acquire(&self, name: &str) -> Result<LockHandle> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(name);

        if let Some(handle) = self.try_create(name, &path)? {
            return Ok(handle);
        }

        let holder = read_holder(&path);
        match holder {
            Some(meta) if is_process_running(meta.pid) => Err(BackupError::LockHeld {
                project: name.to_string(),
                pid: meta.pid,
            }),
            _ => {
                let dead_pid = holder.as_ref().map(|m| m.pid).unwrap_or(0);
                if self.reclaim(name, &path, dead_pid)? {
                    let stale = BackupError::StaleLock {
                        project: name.to_string(),
                        pid: dead_pid,
                    };
                    info!(project = %name, "{}", stale);
                }
                match self.try_create(name, &path)? {
                    Some(handle) => Ok(handle),
                    None => Err(BackupError::LockHeld {
                        project: name.to_string(),
                        pid: read_holder(&path).map(|m| m.pid).unwrap_or(0),
                    }),
                }
            }
        }
    }

    /// Current holder of `name`, if any.
    pub fn holder(&self, name: &str) -> Option<LockMeta> {
        read_holder(&self.lock_path(name))
    }

    /// Whether `name` is held by a running process.
    pub fn is_locked(&self, name: &str) -> bool {
        self.holder(name)
            .map(|meta| is_process_running(meta.pid))
            .unwrap_or(false)
    }

    /// Remove every lock whose holder is no longer running. Returns the names
    /// of reclaimed locks.
    pub fn reclaim_stale(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reclaimed = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(name) = file_name.strip_suffix(".lock") else {
                continue;
            };
            let path = entry.path();
            let holder = read_holder(&path);
            if holder.as_ref().map(|m| is_process_running(m.pid)).unwrap_or(false) {
                continue;
            }
            let pid = holder.map(|m| m.pid).unwrap_or(0);
            if self.reclaim(name, &path, pid)? {
                info!(project = %name, pid, "Reclaimed stale lock");
                reclaimed.push(name.to_string());
            }
        }
        Ok(reclaimed)
    }

    fn try_create(&self, name: &str, path: &Path) -> Result<Option<LockHandle>> {
        let meta = LockMeta::current();
        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        writeln!(temp, "{}", serde_json::to_string(&meta)?)?;
        temp.as_file().sync_all()?;

        match fs::hard_link(temp.path(), path) {
            Ok(()) => Ok(Some(LockHandle {
                name: name.to_string(),
                path: path.to_path_buf(),
                meta,
                released: false,
            })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(BackupError::Lock {
                project: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Move a stale lock aside and delete it if it still belongs to
    /// `expected_pid`. If another process replaced it in the meantime the
    /// live lock is put back.
    fn reclaim(&self, name: &str, path: &Path, expected_pid: u32) -> Result<bool> {
        let aside = self
            .dir
            .join(format!(".{name}.stale.{}", std::process::id()));
        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let moved = read_holder(&aside);
        let still_stale = match &moved {
            Some(meta) => meta.pid == expected_pid || !is_process_running(meta.pid),
            None => true,
        };

        if still_stale {
            fs::remove_file(&aside)?;
            return Ok(true);
        }

        // A live holder took the lock between our read and rename
        if let Err(e) = fs::hard_link(&aside, path) {
            warn!(project = %name, error = %e, "Could not restore live lock moved during reclaim");
        }
        let _ = fs::remove_file(&aside);
        Ok(false)
    }
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &LockMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock, only removing the file if it is still ours.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()?;
        Ok(())
    }

    fn release_inner(&mut self) -> io::Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match read_holder(&self.path) {
            Some(meta) if meta == self.meta => match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            },
            _ => Ok(()),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(project = %self.name, error = %e, "Failed to release lock");
        }
    }
}

/// Parse a lock file. Accepts the JSON record or a bare pid.
fn read_holder(path: &Path) -> Option<LockMeta> {
    let content = fs::read_to_string(path).ok()?;
    let content = content.trim();
    if let Ok(meta) = serde_json::from_str::<LockMeta>(content) {
        return Some(meta);
    }
    content.parse::<u32>().ok().map(|pid| LockMeta {
        pid,
        acquired_at: DateTime::<Utc>::MIN_UTC,
    })
}
