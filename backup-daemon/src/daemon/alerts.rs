//! Per-project failure tracking and notifications.
//!
//! A failure record is kept per project under `failures/<project>.json`.
//! Notifications fire only on transitions: once when a project starts
//! failing and once when it recovers. Repeated identical failures only bump
//! the count.

use crate::config::{NotifyConfig, StatePaths};
use crate::executor::CycleReport;
use crate::utils::atomic::{read_json, write_json_atomic};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureRecord {
    pub project: String,
    pub consecutive_failures: u32,
    pub failing_since: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_kind: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl FailureRecord {
    pub fn is_failing(&self) -> bool {
        self.consecutive_failures > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Healthy to failing
    Failing,
    /// Failing to healthy
    Recovered,
    Unchanged,
}

/// Persists failure counts and decides when to notify.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    state: StatePaths,
    notifier: Notifier,
}

impl FailureTracker {
    pub fn new(state: &StatePaths, notifier: Notifier) -> Self {
        Self {
            state: state.clone(),
            notifier,
        }
    }

    pub fn load(&self, project: &str) -> Result<FailureRecord> {
        let mut record: FailureRecord = read_json(&self.state.failure_record(project))?.unwrap_or_default();
        record.project = project.to_string();
        Ok(record)
    }

    pub fn record_failure(&self, project: &str, error: &str, kind: &str, at: DateTime<Utc>) -> Result<Transition> {
        let mut record = self.load(project)?;
        let transition = if record.is_failing() {
            Transition::Unchanged
        } else {
            record.failing_since = Some(at);
            Transition::Failing
        };
        record.consecutive_failures += 1;
        record.last_failure_at = Some(at);
        record.last_error = Some(error.to_string());
        record.last_kind = Some(kind.to_string());
        write_json_atomic(&self.state.failure_record(project), &record)?;
        Ok(transition)
    }

    pub fn record_success(&self, project: &str, at: DateTime<Utc>) -> Result<Transition> {
        let mut record = self.load(project)?;
        let transition = if record.is_failing() {
            Transition::Recovered
        } else {
            Transition::Unchanged
        };
        record.consecutive_failures = 0;
        record.failing_since = None;
        record.last_success_at = Some(at);
        write_json_atomic(&self.state.failure_record(project), &record)?;
        Ok(transition)
    }

    /// Fold a finished cycle into the record and notify on transitions.
    /// Partial cycles count as failures: something needs attention.
    pub async fn observe(&self, report: &CycleReport) -> Result<Transition> {
        let project = report.project.as_str();
        let transition = if report.errors == 0 && report.is_local_success() {
            self.record_success(project, report.completed_at)?
        } else {
            let error = report.error.as_deref().unwrap_or("backup cycle failed");
            let kind = report.error_kind.as_deref().unwrap_or("unknown");
            self.record_failure(project, error, kind, report.completed_at)?
        };

        match transition {
            Transition::Failing => {
                let body = report.error.clone().unwrap_or_else(|| "backup cycle failed".to_string());
                warn!(project = %project, "Backups failing: {}", body);
                self.notifier.notify(&format!("Backup failing: {project}"), &body).await;
            }
            Transition::Recovered => {
                info!(project = %project, "Backups recovered");
                self.notifier
                    .notify(&format!("Backup recovered: {project}"), "Backups are succeeding again")
                    .await;
            }
            Transition::Unchanged => {}
        }
        Ok(transition)
    }
}

/// Runs the configured notification command, `<command> <title> <body>`.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    command: Option<String>,
}

impl Notifier {
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            command: config.command.clone().filter(|c| !c.trim().is_empty()),
        }
    }

    pub async fn notify(&self, title: &str, body: &str) {
        let Some(command) = &self.command else {
            return;
        };
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return;
        };
        let status = Command::new(program)
            .args(parts)
            .arg(title)
            .arg(body)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        match status {
            Ok(status) if status.success() => debug!("Notification sent: {}", title),
            Ok(status) => warn!("Notification command exited with {}", status),
            Err(e) => warn!("Failed to run notification command {}: {}", program, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_transitions_notify_once() -> Result<()> {
        let dir = TempDir::new()?;
        let tracker = FailureTracker::new(&StatePaths::new(dir.path()), Notifier::default());
        let now = Utc::now();

        assert_eq!(tracker.record_success("app", now)?, Transition::Unchanged);
        assert_eq!(tracker.record_failure("app", "disk full", "io", now)?, Transition::Failing);
        assert_eq!(tracker.record_failure("app", "disk full", "io", now)?, Transition::Unchanged);
        assert_eq!(tracker.record_failure("app", "disk full", "io", now)?, Transition::Unchanged);

        let record = tracker.load("app")?;
        assert_eq!(record.consecutive_failures, 3);
        assert_eq!(record.failing_since, Some(now));

        assert_eq!(tracker.record_success("app", now)?, Transition::Recovered);
        assert_eq!(tracker.load("app")?.consecutive_failures, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_notify_command_receives_title_and_body() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("notified");
        let script = dir.path().join("notify.sh");
        fs::write(&script, format!("#!/bin/sh\nprintf '%s|%s' \"$1\" \"$2\" > {}\n", out.display()))?;
        let notifier = Notifier::from_config(&NotifyConfig {
            command: Some(format!("sh {}", script.display())),
        });

        notifier.notify("Backup failing: app", "disk full").await;
        assert_eq!(fs::read_to_string(&out)?, "Backup failing: app|disk full");
        Ok(())
    }
}
