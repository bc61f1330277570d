//! Daemon heartbeat.
//!
//! One rolling record per machine, rewritten atomically on every state
//! transition. Readers must not trust `status` alone: a record older than
//! the liveness threshold means the daemon stopped writing, whatever it
//! last claimed.

use crate::config::WatchdogConfig;
use crate::executor::phase::Phase;
use crate::utils::atomic::{read_json, write_json_atomic};
use crate::ws::{DaemonEvent, EventBus};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeartbeatStatus {
    Healthy,
    Syncing,
    Error,
    /// Daemon paused or shut down cleanly
    Stopped,
    /// Record not refreshed within the liveness threshold
    Stale,
    /// Daemon alive but no recent successful backup or cloud upload
    BackupsStale,
    /// No record at all
    Missing,
}

impl HeartbeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatStatus::Healthy => "healthy",
            HeartbeatStatus::Syncing => "syncing",
            HeartbeatStatus::Error => "error",
            HeartbeatStatus::Stopped => "stopped",
            HeartbeatStatus::Stale => "stale",
            HeartbeatStatus::BackupsStale => "backups-stale",
            HeartbeatStatus::Missing => "missing",
        }
    }

    /// Whether the condition needs attention.
    pub fn is_unhealthy(&self) -> bool {
        matches!(
            self,
            HeartbeatStatus::Error | HeartbeatStatus::Stale | HeartbeatStatus::Missing | HeartbeatStatus::BackupsStale
        )
    }
}

impl std::fmt::Display for HeartbeatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    pub status: HeartbeatStatus,
    pub project: Option<String>,
    pub last_backup: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_backup_files: usize,
    pub error: Option<String>,
    pub pid: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syncing_project_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syncing_total_projects: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syncing_current_project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syncing_backed_up: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syncing_failed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syncing_skipped: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cloud_sync: Option<DateTime<Utc>>,
    /// First failed upload since the last success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_failing_since: Option<DateTime<Utc>>,
}

/// Aggregate counters for a multi-project pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    pub backed_up: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Heartbeat {
    pub fn new(pid: u32) -> Self {
        Self {
            timestamp: Utc::now(),
            status: HeartbeatStatus::Healthy,
            project: None,
            last_backup: None,
            last_backup_files: 0,
            error: None,
            pid,
            phase: None,
            percent: None,
            syncing_project_index: None,
            syncing_total_projects: None,
            syncing_current_project: None,
            syncing_backed_up: None,
            syncing_failed: None,
            syncing_skipped: None,
            last_cloud_sync: None,
            cloud_failing_since: None,
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }

    fn clear_syncing(&mut self) {
        self.phase = None;
        self.percent = None;
        self.syncing_project_index = None;
        self.syncing_total_projects = None;
        self.syncing_current_project = None;
        self.syncing_backed_up = None;
        self.syncing_failed = None;
        self.syncing_skipped = None;
    }

    /// Status a reader should act on, with staleness applied.
    pub fn effective_status(&self, now: DateTime<Utc>, thresholds: &WatchdogConfig) -> HeartbeatStatus {
        let age = now.signed_duration_since(self.timestamp);
        if age > Duration::seconds(thresholds.stale_after_secs as i64) {
            return HeartbeatStatus::Stale;
        }
        match self.status {
            HeartbeatStatus::Healthy => {
                if self.backups_overdue(now, thresholds).is_some() || self.cloud_overdue(now, thresholds) {
                    HeartbeatStatus::BackupsStale
                } else {
                    HeartbeatStatus::Healthy
                }
            }
            other => other,
        }
    }

    /// Severity when the last successful backup is older than the warning
    /// or critical threshold.
    pub fn backups_overdue(&self, now: DateTime<Utc>, thresholds: &WatchdogConfig) -> Option<Severity> {
        let last = self.last_backup?;
        let age = now.signed_duration_since(last);
        if age > Duration::hours(thresholds.backup_critical_hours as i64) {
            Some(Severity::Critical)
        } else if age > Duration::hours(thresholds.backup_warning_hours as i64) {
            Some(Severity::Warning)
        } else {
            None
        }
    }

    /// Uploads have been failing for longer than the cloud warning threshold.
    pub fn cloud_overdue(&self, now: DateTime<Utc>, thresholds: &WatchdogConfig) -> bool {
        self.cloud_failing_since
            .map(|since| now.signed_duration_since(since) > Duration::hours(thresholds.cloud_warning_hours as i64))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// Read the heartbeat at `path` and apply staleness. A missing record is
/// `Missing`.
pub fn assess(path: &Path, now: DateTime<Utc>, thresholds: &WatchdogConfig) -> (HeartbeatStatus, Option<Heartbeat>) {
    match Heartbeat::load(path) {
        Ok(Some(hb)) => (hb.effective_status(now, thresholds), Some(hb)),
        Ok(None) => (HeartbeatStatus::Missing, None),
        Err(e) => {
            warn!("Unreadable heartbeat {}: {}", path.display(), e);
            (HeartbeatStatus::Missing, None)
        }
    }
}

/// Owns the heartbeat record of this process and rewrites it on change.
pub struct HeartbeatPublisher {
    path: PathBuf,
    record: Mutex<Heartbeat>,
    events: Option<EventBus>,
}

impl HeartbeatPublisher {
    /// Continue from the existing record so last-backup and cloud state
    /// survive restarts.
    pub fn open(path: impl Into<PathBuf>, events: Option<EventBus>) -> Self {
        let path = path.into();
        let pid = std::process::id();
        let mut record = match Heartbeat::load(&path) {
            Ok(Some(previous)) => previous,
            _ => Heartbeat::new(pid),
        };
        record.pid = pid;
        record.project = None;
        record.clear_syncing();
        Self {
            path,
            record: Mutex::new(record),
            events,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Heartbeat {
        self.lock().clone()
    }

    /// Apply `change`, stamp the record and write it.
    pub fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Heartbeat),
    {
        // Held across the write so the file always ends on the newest record
        let mut record = self.lock();
        let before = record.status;
        change(&mut record);
        record.timestamp = Utc::now();
        write_json_atomic(&self.path, &*record)?;
        let status = record.status;
        drop(record);
        if status != before {
            if let Some(events) = &self.events {
                events.publish(DaemonEvent::Status { status });
            }
        }
        Ok(())
    }

    /// Refresh the timestamp only.
    pub fn touch(&self) -> Result<()> {
        self.update(|_| {})
    }

    pub fn set_status(&self, status: HeartbeatStatus) -> Result<()> {
        self.update(|hb| hb.status = status)
    }

    /// Start of a pass over `total` projects.
    pub fn begin_pass(&self, total: usize) -> Result<()> {
        self.update(|hb| {
            hb.status = HeartbeatStatus::Syncing;
            hb.syncing_total_projects = Some(total);
            hb.syncing_project_index = Some(0);
            hb.syncing_backed_up = Some(0);
            hb.syncing_failed = Some(0);
            hb.syncing_skipped = Some(0);
        })
    }

    /// `index` is 1-based.
    pub fn begin_project(&self, index: usize, project: &str, counters: SyncCounters) -> Result<()> {
        self.update(|hb| {
            hb.status = HeartbeatStatus::Syncing;
            hb.project = Some(project.to_string());
            hb.syncing_project_index = Some(index);
            hb.syncing_current_project = Some(project.to_string());
            apply_counters(hb, counters);
        })
    }

    pub fn phase(&self, phase: Phase, percent: Option<u8>) -> Result<()> {
        self.update(|hb| {
            hb.phase = Some(phase);
            hb.percent = percent;
        })
    }

    pub fn progress(&self, percent: u8) -> Result<()> {
        self.update(|hb| hb.percent = Some(percent))
    }

    /// Record a successful cycle.
    pub fn backup_succeeded(&self, at: DateTime<Utc>, files: usize) -> Result<()> {
        self.update(|hb| {
            hb.last_backup = Some(at);
            hb.last_backup_files = files;
        })
    }

    /// End of a pass. `error` is the last failure of the pass, if any.
    pub fn end_pass(&self, error: Option<String>) -> Result<()> {
        self.update(|hb| {
            hb.clear_syncing();
            hb.project = None;
            hb.status = if error.is_some() {
                HeartbeatStatus::Error
            } else {
                HeartbeatStatus::Healthy
            };
            hb.error = error;
        })
    }

    pub fn cloud_result(&self, success: bool, at: DateTime<Utc>) -> Result<()> {
        self.update(|hb| {
            if success {
                hb.last_cloud_sync = Some(at);
                hb.cloud_failing_since = None;
            } else if hb.cloud_failing_since.is_none() {
                hb.cloud_failing_since = Some(at);
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Heartbeat> {
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn apply_counters(hb: &mut Heartbeat, counters: SyncCounters) {
    hb.syncing_backed_up = Some(counters.backed_up);
    hb.syncing_failed = Some(counters.failed);
    hb.syncing_skipped = Some(counters.skipped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn thresholds() -> WatchdogConfig {
        WatchdogConfig::default()
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        assert_eq!(serde_json::to_string(&HeartbeatStatus::BackupsStale).unwrap(), "\"backups-stale\"");
        assert_eq!(serde_json::to_string(&HeartbeatStatus::Healthy).unwrap(), "\"healthy\"");
    }

    #[test]
    fn test_old_record_is_stale_whatever_it_claims() {
        let mut hb = Heartbeat::new(1);
        hb.status = HeartbeatStatus::Syncing;
        hb.timestamp = Utc::now() - Duration::hours(1);
        assert_eq!(hb.effective_status(Utc::now(), &thresholds()), HeartbeatStatus::Stale);
    }

    #[test]
    fn test_backups_stale_thresholds() {
        let now = Utc::now();
        let mut hb = Heartbeat::new(1);
        hb.last_backup = Some(now - Duration::hours(2));
        assert_eq!(hb.effective_status(now, &thresholds()), HeartbeatStatus::Healthy);

        hb.last_backup = Some(now - Duration::hours(30));
        assert_eq!(hb.effective_status(now, &thresholds()), HeartbeatStatus::BackupsStale);
        assert_eq!(hb.backups_overdue(now, &thresholds()), Some(Severity::Warning));

        hb.last_backup = Some(now - Duration::hours(100));
        assert_eq!(hb.backups_overdue(now, &thresholds()), Some(Severity::Critical));
    }

    #[test]
    fn test_cloud_failure_stale_only_after_threshold() {
        let now = Utc::now();
        let mut hb = Heartbeat::new(1);
        hb.last_backup = Some(now);
        hb.cloud_failing_since = Some(now - Duration::minutes(5));
        assert_eq!(hb.effective_status(now, &thresholds()), HeartbeatStatus::Healthy);

        hb.cloud_failing_since = Some(now - Duration::hours(25));
        assert_eq!(hb.effective_status(now, &thresholds()), HeartbeatStatus::BackupsStale);
    }

    #[test]
    fn test_assess_missing() {
        let dir = TempDir::new().unwrap();
        let (status, record) = assess(&dir.path().join("heartbeat.json"), Utc::now(), &thresholds());
        assert_eq!(status, HeartbeatStatus::Missing);
        assert!(record.is_none());
    }

    #[test]
    fn test_publisher_pass_lifecycle() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("heartbeat.json");
        let publisher = HeartbeatPublisher::open(&path, None);

        publisher.begin_pass(2)?;
        publisher.begin_project(1, "app", SyncCounters::default())?;
        publisher.phase(Phase::Copying, Some(40))?;

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(raw["status"], "syncing");
        assert_eq!(raw["syncing_total_projects"], 2);
        assert_eq!(raw["syncing_current_project"], "app");
        assert_eq!(raw["phase"], "copying");
        assert_eq!(raw["pid"], std::process::id());

        publisher.backup_succeeded(Utc::now(), 3)?;
        publisher.begin_project(
            2,
            "web",
            SyncCounters {
                backed_up: 1,
                failed: 0,
                skipped: 0,
            },
        )?;
        publisher.end_pass(None)?;
        let hb = Heartbeat::load(&path)?.unwrap();
        assert_eq!(hb.status, HeartbeatStatus::Healthy);
        assert_eq!(hb.last_backup_files, 3);
        assert!(hb.syncing_total_projects.is_none());
        Ok(())
    }

    #[test]
    fn test_publisher_keeps_history_across_restart() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("heartbeat.json");
        let at = Utc::now() - Duration::hours(1);
        HeartbeatPublisher::open(&path, None).backup_succeeded(at, 7)?;

        let reopened = HeartbeatPublisher::open(&path, None);
        assert_eq!(reopened.snapshot().last_backup_files, 7);
        assert_eq!(reopened.snapshot().last_backup, Some(at));
        Ok(())
    }

    #[test]
    fn test_cloud_failing_since_kept_until_success() -> Result<()> {
        let dir = TempDir::new()?;
        let publisher = HeartbeatPublisher::open(dir.path().join("hb.json"), None);
        let first = Utc::now() - Duration::hours(3);
        publisher.cloud_result(false, first)?;
        publisher.cloud_result(false, Utc::now())?;
        assert_eq!(publisher.snapshot().cloud_failing_since, Some(first));

        publisher.cloud_result(true, Utc::now())?;
        assert!(publisher.snapshot().cloud_failing_since.is_none());
        assert!(publisher.snapshot().last_cloud_sync.is_some());
        Ok(())
    }

    #[test]
    fn test_concurrent_writers_leave_newest_record() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("hb.json");
        let publisher = HeartbeatPublisher::open(&path, None);

        std::thread::scope(|scope| {
            for worker in 0..4usize {
                let publisher = &publisher;
                scope.spawn(move || {
                    for n in 0..25 {
                        publisher
                            .update(|hb| hb.last_backup_files = worker * 100 + n)
                            .unwrap();
                        publisher.touch().unwrap();
                    }
                });
            }
        });

        let on_disk = Heartbeat::load(&path)?.unwrap();
        let in_memory = publisher.snapshot();
        assert_eq!(on_disk.last_backup_files, in_memory.last_backup_files);
        assert_eq!(on_disk.timestamp, in_memory.timestamp);
        Ok(())
    }
}
