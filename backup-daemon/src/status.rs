//! Aggregated status for the CLI and the API.

use crate::cloud::record::{Category, CloudUploadRecord};
use crate::config::Config;
use crate::daemon::alerts::FailureRecord;
use crate::daemon::heartbeat::{assess, Heartbeat, HeartbeatStatus};
use crate::daemon::lock::LockManager;
use crate::daemon::triggers::{pause_state, PauseMarker};
use crate::daemon::watchdog::{supervisor_liveness, Liveness};
use crate::executor::manifest::{Manifest, Outcome};
use crate::registry::ProjectRegistry;
use crate::transfer::progress::{format_bytes, format_duration, ProgressRecord};
use crate::utils::atomic::read_json;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct CloudStatus {
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub pending: Vec<Category>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub name: String,
    pub path: PathBuf,
    pub enabled: bool,
    pub last_backup: Option<DateTime<Utc>>,
    pub running: bool,
    pub files: Option<usize>,
    pub bytes: Option<u64>,
    pub databases: Option<usize>,
    pub last_outcome: Option<Outcome>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub cloud: Option<CloudStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    /// Heartbeat status with staleness applied
    pub status: HeartbeatStatus,
    pub heartbeat: Option<Heartbeat>,
    pub watchdog: Liveness,
    pub paused: Option<PauseMarker>,
    pub progress: Option<ProgressRecord>,
    pub projects: Vec<ProjectStatus>,
}

impl StatusReport {
    pub fn collect(config: &Config, now: DateTime<Utc>) -> Result<Self> {
        let state = config.state_paths();
        let (status, heartbeat) = assess(&state.heartbeat(), now, &config.watchdog);
        let locks = LockManager::new(state.locks_dir());
        let registry = ProjectRegistry::load(&state.registry())?;

        let mut projects = Vec::new();
        for project in &registry.projects {
            let paths = config.project_paths(&project.name);
            let manifest = Manifest::load(&paths.manifest()).unwrap_or_else(|e| {
                debug!(project = %project.name, "Unreadable manifest: {}", e);
                None
            });
            let failures: FailureRecord = read_json(&state.failure_record(&project.name))
                .ok()
                .flatten()
                .unwrap_or_default();
            let cloud = read_json::<CloudUploadRecord>(&state.cloud_record(&project.name))
                .ok()
                .flatten()
                .map(|r| CloudStatus {
                    last_attempt: r.last_attempt,
                    last_success: r.last_success,
                    consecutive_failures: r.consecutive_failures,
                    pending: r.pending.into_iter().collect(),
                });

            projects.push(ProjectStatus {
                name: project.name.clone(),
                path: project.path.clone(),
                enabled: project.enabled,
                last_backup: project.last_backup,
                running: locks.is_locked(&project.name),
                files: manifest.as_ref().map(|m| m.totals.files),
                bytes: manifest.as_ref().map(|m| m.totals.bytes + m.totals.database_bytes),
                databases: manifest.as_ref().map(|m| m.totals.databases),
                last_outcome: manifest.as_ref().map(|m| m.outcome),
                consecutive_failures: failures.consecutive_failures,
                last_error: failures.last_error.filter(|_| failures.consecutive_failures > 0),
                cloud,
            });
        }

        Ok(Self {
            generated_at: now,
            status,
            heartbeat,
            watchdog: supervisor_liveness(&state.watchdog(), now, &config.watchdog),
            paused: pause_state(&state, now),
            progress: ProgressRecord::load(&state.progress()).ok().flatten(),
            projects,
        })
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            HeartbeatStatus::Error | HeartbeatStatus::Stale | HeartbeatStatus::Missing => 1,
            _ => 0,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Daemon:   {}", self.status);
        if let Some(hb) = &self.heartbeat {
            let _ = writeln!(out, "  pid {} · updated {}", hb.pid, ago(self.generated_at, hb.timestamp));
            if let Some(last) = hb.last_backup {
                let _ = writeln!(
                    out,
                    "  last backup {} ({} files)",
                    ago(self.generated_at, last),
                    hb.last_backup_files
                );
            }
            if let Some(last) = hb.last_cloud_sync {
                let _ = writeln!(out, "  last cloud sync {}", ago(self.generated_at, last));
            }
            if let Some(error) = &hb.error {
                let _ = writeln!(out, "  error: {error}");
            }
        }
        let _ = writeln!(out, "Watchdog: {:?}", self.watchdog);
        if let Some(paused) = &self.paused {
            match paused.until {
                Some(until) => {
                    let _ = writeln!(out, "Paused until {}", until.format("%Y-%m-%d %H:%M UTC"));
                }
                None => {
                    let _ = writeln!(out, "Paused");
                }
            }
        }
        if let Some(progress) = &self.progress {
            if progress.phase != crate::executor::phase::Phase::Idle {
                let _ = writeln!(
                    out,
                    "Running:  {} {} {}% ({}/{})",
                    progress.project.as_deref().unwrap_or("-"),
                    progress.phase,
                    progress.percent,
                    progress.files_processed,
                    progress.total_files
                );
            }
        }

        let _ = writeln!(out, "\nProjects:");
        if self.projects.is_empty() {
            let _ = writeln!(out, "  (none registered)");
        }
        for p in &self.projects {
            let state = if !p.enabled {
                "disabled"
            } else if p.running {
                "running"
            } else if p.consecutive_failures > 0 {
                "failing"
            } else {
                "ok"
            };
            let last = p
                .last_backup
                .map(|t| ago(self.generated_at, t))
                .unwrap_or_else(|| "never".to_string());
            let _ = write!(out, "  {:<20} {:<8} last {}", p.name, state, last);
            if let (Some(files), Some(bytes)) = (p.files, p.bytes) {
                let _ = write!(out, " · {} files · {}", files, format_bytes(bytes));
            }
            if let Some(dbs) = p.databases.filter(|n| *n > 0) {
                let _ = write!(out, " · {dbs} db");
            }
            let _ = writeln!(out);
            if let Some(error) = &p.last_error {
                let _ = writeln!(out, "      {} failure(s): {}", p.consecutive_failures, error);
            }
            if let Some(cloud) = &p.cloud {
                let synced = cloud
                    .last_success
                    .map(|t| ago(self.generated_at, t))
                    .unwrap_or_else(|| "never".to_string());
                let _ = write!(out, "      cloud synced {synced}");
                if !cloud.pending.is_empty() {
                    let pending: Vec<&str> = cloud.pending.iter().map(|c| c.as_str()).collect();
                    let _ = write!(out, " · pending {}", pending.join(", "));
                }
                let _ = writeln!(out);
            }
        }
        out
    }
}

fn ago(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(then).num_seconds().max(0) as u64;
    format!("{} ago", format_duration(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::heartbeat::HeartbeatPublisher;
    use tempfile::TempDir;

    #[test]
    fn test_missing_heartbeat_is_nonzero() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = Config::default();
        config.daemon.state_dir = dir.path().to_path_buf();

        let report = StatusReport::collect(&config, Utc::now())?;
        assert_eq!(report.status, HeartbeatStatus::Missing);
        assert_eq!(report.exit_code(), 1);
        assert!(report.render().contains("(none registered)"));
        Ok(())
    }

    #[test]
    fn test_projects_listed_with_state() -> Result<()> {
        let state = TempDir::new()?;
        let project = TempDir::new()?;
        let mut config = Config::default();
        config.daemon.state_dir = state.path().to_path_buf();
        config.backup.root = state.path().join("backups");

        let mut registry = ProjectRegistry::load(&config.state_paths().registry())?;
        let name = registry.add(project.path())?.name.clone();
        let hb = HeartbeatPublisher::open(config.state_paths().heartbeat(), None);
        hb.backup_succeeded(Utc::now(), 3)?;

        let report = StatusReport::collect(&config, Utc::now())?;
        assert_eq!(report.status, HeartbeatStatus::Healthy);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.projects.len(), 1);
        assert_eq!(report.projects[0].name, name);
        assert!(!report.projects[0].running);
        assert!(report.render().contains(&name));

        let json = serde_json::to_value(&report)?;
        assert_eq!(json["status"], "healthy");
        Ok(())
    }
}
