//! Independent liveness supervisor.
//!
//! Runs in its own process. Each tick it rewrites `watchdog.json`, proving
//! the supervisor itself is alive, then reads the daemon's heartbeat. A
//! daemon that stopped writing is `stale`; a daemon that writes but has not
//! produced a backup within the warning threshold is `backups-stale`.

use crate::config::{Config, StatePaths, WatchdogConfig};
use crate::daemon::alerts::Notifier;
use crate::daemon::heartbeat::{assess, HeartbeatStatus, Severity};
use crate::utils::atomic::{read_json, write_json_atomic};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogRecord {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    /// Daemon status observed on the last tick
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_status: Option<HeartbeatStatus>,
}

impl WatchdogRecord {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Healthy,
    Stale,
    Missing,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogCheck {
    pub checked_at: DateTime<Utc>,
    pub supervisor: Liveness,
    pub daemon: HeartbeatStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backups_overdue: Option<Severity>,
    pub cloud_overdue: bool,
}

impl WatchdogCheck {
    pub fn is_healthy(&self) -> bool {
        self.supervisor == Liveness::Healthy && !self.daemon.is_unhealthy()
    }
}

/// Liveness of the supervisor record at `path`.
pub fn supervisor_liveness(path: &Path, now: DateTime<Utc>, thresholds: &WatchdogConfig) -> Liveness {
    match WatchdogRecord::load(path) {
        Ok(Some(record)) => {
            let age = now.signed_duration_since(record.timestamp);
            if age > Duration::seconds(thresholds.stale_after_secs as i64) {
                Liveness::Stale
            } else {
                Liveness::Healthy
            }
        }
        _ => Liveness::Missing,
    }
}

/// Evaluate both records without writing anything.
pub fn check(state: &StatePaths, thresholds: &WatchdogConfig, now: DateTime<Utc>) -> WatchdogCheck {
    let (daemon, heartbeat) = assess(&state.heartbeat(), now, thresholds);
    WatchdogCheck {
        checked_at: now,
        supervisor: supervisor_liveness(&state.watchdog(), now, thresholds),
        daemon,
        backups_overdue: heartbeat.as_ref().and_then(|hb| hb.backups_overdue(now, thresholds)),
        cloud_overdue: heartbeat.as_ref().map(|hb| hb.cloud_overdue(now, thresholds)).unwrap_or(false),
    }
}

pub struct Watchdog {
    state: StatePaths,
    thresholds: WatchdogConfig,
    notifier: Notifier,
    last_status: Mutex<Option<HeartbeatStatus>>,
}

impl Watchdog {
    pub fn new(config: &Config) -> Self {
        Self {
            state: config.state_paths(),
            thresholds: config.watchdog.clone(),
            notifier: Notifier::from_config(&config.notify),
            last_status: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.thresholds.interval_secs.max(1))
    }

    /// Refresh the supervisor record, check the daemon and notify when its
    /// status moves between healthy and unhealthy.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<WatchdogCheck> {
        let (daemon, _) = assess(&self.state.heartbeat(), now, &self.thresholds);
        let record = WatchdogRecord {
            timestamp: now,
            pid: std::process::id(),
            daemon_status: Some(daemon),
        };
        write_json_atomic(&self.state.watchdog(), &record)?;
        let result = check(&self.state, &self.thresholds, now);

        let previous = {
            let mut last = self.last_status.lock().unwrap_or_else(|p| p.into_inner());
            last.replace(result.daemon)
        };
        let was_unhealthy = previous.map(|s| s.is_unhealthy()).unwrap_or(false);
        let is_unhealthy = result.daemon.is_unhealthy();

        if is_unhealthy && !was_unhealthy {
            let body = match result.daemon {
                HeartbeatStatus::Stale => "The backup daemon stopped updating its heartbeat".to_string(),
                HeartbeatStatus::Missing => "No backup daemon heartbeat found".to_string(),
                HeartbeatStatus::BackupsStale => match result.backups_overdue {
                    Some(Severity::Critical) => "No successful backup within the critical threshold".to_string(),
                    _ if result.cloud_overdue => "Cloud uploads have been failing".to_string(),
                    _ => "No successful backup within the warning threshold".to_string(),
                },
                other => format!("Backup daemon reports {other}"),
            };
            warn!(status = %result.daemon, "{}", body);
            self.notifier.notify("Backups need attention", &body).await;
        } else if was_unhealthy && !is_unhealthy {
            info!(status = %result.daemon, "Backup daemon healthy again");
            self.notifier.notify("Backups healthy", "The backup daemon is healthy again").await;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::heartbeat::Heartbeat;
    use tempfile::TempDir;

    fn write_heartbeat(state: &StatePaths, hb: &Heartbeat) {
        write_json_atomic(&state.heartbeat(), hb).unwrap();
    }

    #[test]
    fn test_missing_records() {
        let dir = TempDir::new().unwrap();
        let state = StatePaths::new(dir.path());
        let result = check(&state, &WatchdogConfig::default(), Utc::now());
        assert_eq!(result.supervisor, Liveness::Missing);
        assert_eq!(result.daemon, HeartbeatStatus::Missing);
        assert!(!result.is_healthy());
    }

    #[tokio::test]
    async fn test_tick_reports_stale_daemon() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = Config::default();
        config.daemon.state_dir = dir.path().to_path_buf();
        let state = config.state_paths();
        let now = Utc::now();

        let mut hb = Heartbeat::new(1);
        hb.timestamp = now - Duration::minutes(30);
        hb.last_backup = Some(now - Duration::hours(1));
        write_heartbeat(&state, &hb);

        let watchdog = Watchdog::new(&config);
        let result = watchdog.tick(now).await?;
        assert_eq!(result.supervisor, Liveness::Healthy);
        assert_eq!(result.daemon, HeartbeatStatus::Stale);

        let record = WatchdogRecord::load(&state.watchdog())?.unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.daemon_status, Some(HeartbeatStatus::Stale));
        Ok(())
    }

    #[test]
    fn test_backups_stale_distinct_from_stale() {
        let dir = TempDir::new().unwrap();
        let state = StatePaths::new(dir.path());
        let thresholds = WatchdogConfig::default();
        let now = Utc::now();

        let mut hb = Heartbeat::new(1);
        hb.timestamp = now;
        hb.last_backup = Some(now - Duration::hours(30));
        write_heartbeat(&state, &hb);

        let result = check(&state, &thresholds, now);
        assert_eq!(result.daemon, HeartbeatStatus::BackupsStale);
        assert_eq!(result.backups_overdue, Some(Severity::Warning));

        hb.last_backup = Some(now - Duration::hours(80));
        write_heartbeat(&state, &hb);
        assert_eq!(check(&state, &thresholds, now).backups_overdue, Some(Severity::Critical));
    }

    #[test]
    fn test_old_supervisor_record_is_stale() {
        let dir = TempDir::new().unwrap();
        let state = StatePaths::new(dir.path());
        let now = Utc::now();
        let record = WatchdogRecord {
            timestamp: now - Duration::minutes(10),
            pid: 1,
            daemon_status: None,
        };
        write_json_atomic(&state.watchdog(), &record).unwrap();
        assert_eq!(
            supervisor_liveness(&state.watchdog(), now, &WatchdogConfig::default()),
            Liveness::Stale
        );
    }
}
