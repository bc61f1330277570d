//! Database snapshot manager.
//!
//! Detects the databases a project uses and writes one verified, compressed
//! dump per local database per cycle into `databases/`. Remote databases
//! are reported and never dumped.

pub mod deps;
pub mod detect;
pub mod engine;

use crate::executor::manifest::{DatabaseEntry, ErrorRecord};
use crate::executor::snapshot::archive_stamp;
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use detect::{DatabaseCandidate, Target};
use engine::{compress_file, run_dump_command, sqlite_backup, Engine};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

pub use detect::{detect, DetectOptions, Locality};

/// Outcome of dumping every candidate of one project.
#[derive(Debug, Default)]
pub struct DatabaseReport {
    /// Verified dumps
    pub entries: Vec<DatabaseEntry>,
    /// Candidates listed for visibility only
    pub remote: Vec<DatabaseCandidate>,
    pub errors: Vec<ErrorRecord>,
    /// Tools whose absence blocked a dump
    pub missing_tools: Vec<String>,
}

impl DatabaseReport {
    pub fn failed(&self) -> usize {
        self.errors.len()
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseSnapshotManager {
    /// Project backup root; entry paths are relative to it
    backup_root: PathBuf,
    databases_dir: PathBuf,
    stamp: String,
    pid: u32,
    compression_level: i32,
}

impl DatabaseSnapshotManager {
    pub fn new(
        backup_root: impl Into<PathBuf>,
        databases_dir: impl Into<PathBuf>,
        started_at: DateTime<Utc>,
        pid: u32,
        compression_level: i32,
    ) -> Self {
        Self {
            backup_root: backup_root.into(),
            databases_dir: databases_dir.into(),
            stamp: archive_stamp(started_at),
            pid,
            compression_level,
        }
    }

    /// Dump every local candidate. Failures are collected per database.
    pub async fn snapshot_all(&self, candidates: Vec<DatabaseCandidate>) -> DatabaseReport {
        let mut report = DatabaseReport::default();
        for candidate in candidates {
            if !candidate.is_local() {
                info!(
                    name = %candidate.name,
                    engine = %candidate.engine,
                    "Remote database detected, not dumping"
                );
                report.remote.push(candidate);
                continue;
            }
            match self.snapshot(&candidate).await {
                Ok(entry) => {
                    info!(
                        name = %entry.name,
                        engine = %entry.engine,
                        size = entry.size,
                        tables = ?entry.tables,
                        "Database snapshot verified"
                    );
                    report.entries.push(entry);
                }
                Err(e) => {
                    warn!(name = %candidate.name, "Database snapshot failed: {}", e);
                    if let BackupError::DependencyMissing { tool } = &e {
                        if !report.missing_tools.contains(tool) {
                            report.missing_tools.push(tool.clone());
                        }
                    }
                    report.errors.push(ErrorRecord::from_error(&e));
                }
            }
        }
        report
    }

    /// Dump and verify one candidate.
    pub async fn snapshot(&self, candidate: &DatabaseCandidate) -> Result<DatabaseEntry> {
        if !candidate.is_local() {
            return Err(BackupError::DatabaseDump {
                name: candidate.name.clone(),
                reason: "remote databases are never dumped".to_string(),
            });
        }
        tokio::fs::create_dir_all(&self.databases_dir).await?;
        let destination = self.destination(&candidate.name, candidate.engine);

        match &candidate.target {
            Target::File { path } => {
                self.dump_sqlite(&candidate.name, path, &destination).await?;
            }
            Target::Server(info) => {
                let cmd = candidate
                    .engine
                    .dump_command(info)
                    .ok_or_else(|| unsupported(candidate))?;
                run_dump_command(cmd, &candidate.name, &destination, self.compression_level).await?;
            }
            Target::LocalServer => {
                let cmd = candidate
                    .engine
                    .server_dump_command()
                    .ok_or_else(|| unsupported(candidate))?;
                run_dump_command(cmd, &candidate.name, &destination, self.compression_level).await?;
            }
        }

        self.verified_entry(&candidate.name, candidate.engine, &destination).await
    }

    /// Run an arbitrary dump command for `name` and verify its output.
    pub async fn snapshot_command(&self, name: &str, engine: Engine, cmd: Command) -> Result<DatabaseEntry> {
        tokio::fs::create_dir_all(&self.databases_dir).await?;
        let destination = self.destination(name, engine);
        run_dump_command(cmd, name, &destination, self.compression_level).await?;
        self.verified_entry(name, engine, &destination).await
    }

    async fn dump_sqlite(&self, name: &str, source: &Path, destination: &Path) -> Result<u64> {
        let source = source.to_path_buf();
        let destination = destination.to_path_buf();
        let staging_dir = self.databases_dir.clone();
        let level = self.compression_level;
        let name = name.to_string();
        let task_name = name.clone();

        tokio::task::spawn_blocking(move || -> Result<u64> {
            let staging = tempfile::Builder::new()
                .prefix(".sqlite-")
                .tempfile_in(&staging_dir)?;
            sqlite_backup(&source, staging.path())?;
            compress_file(staging.path(), &destination, level).map_err(|e| {
                let _ = std::fs::remove_file(&destination);
                BackupError::DatabaseDump {
                    name: name.clone(),
                    reason: format!("compression: {e}"),
                }
            })
        })
        .await
        .map_err(|e| BackupError::DatabaseDump {
            name: task_name,
            reason: format!("dump task failed: {e}"),
        })?
    }

    /// Verify the artifact; a failed check removes it and reports a dump
    /// failure for the database.
    async fn verified_entry(&self, name: &str, engine: Engine, artifact: &Path) -> Result<DatabaseEntry> {
        let path = artifact.to_path_buf();
        let verification = tokio::task::spawn_blocking(move || engine.verify(&path))
            .await
            .map_err(|e| BackupError::DatabaseDump {
                name: name.to_string(),
                reason: format!("verification task failed: {e}"),
            })?;

        let tables = match verification {
            Ok(tables) => tables,
            Err(e) => {
                let _ = tokio::fs::remove_file(artifact).await;
                return Err(BackupError::DatabaseDump {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let size = tokio::fs::metadata(artifact).await?.len();
        let relative = artifact
            .strip_prefix(&self.backup_root)
            .unwrap_or(artifact)
            .to_string_lossy()
            .to_string();

        Ok(DatabaseEntry {
            name: name.to_string(),
            engine,
            path: relative,
            size,
            tables,
            verified: true,
        })
    }

    /// `databases/<safe name>.<stamp>_<pid>[_n].<ext>.zst`, never an
    /// existing file.
    fn destination(&self, name: &str, engine: Engine) -> PathBuf {
        let safe = safe_name(name);
        let mut n = 0;
        loop {
            let suffix = if n == 0 {
                format!("{}_{}", self.stamp, self.pid)
            } else {
                format!("{}_{}_{}", self.stamp, self.pid, n)
            };
            let candidate = self
                .databases_dir
                .join(format!("{safe}.{suffix}.{}.zst", engine.dump_extension()));
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }
}

fn unsupported(candidate: &DatabaseCandidate) -> BackupError {
    BackupError::DatabaseDump {
        name: candidate.name.clone(),
        reason: format!("no dump method for {} target", candidate.engine),
    }
}

/// File-name-safe form of a database name.
pub fn safe_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let safe = safe.trim_matches('_').to_string();
    if safe.is_empty() {
        "database".to_string()
    } else {
        safe
    }
}
