//! Progress record for external viewers.
//!
//! `progress.json` carries the current phase, percent complete and file
//! totals. It is rewritten atomically on every phase change and at most a
//! few times per second during long phases, so viewers polling at will
//! never see a torn record.

use crate::executor::phase::Phase;
use crate::utils::atomic::{read_json, write_json_atomic};
use crate::ws::{DaemonEvent, EventBus};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Minimum interval between throttled progress writes
const UPDATE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// 0-100
    pub percent: u8,
    pub phase: Phase,
    pub total_files: usize,
    #[serde(default)]
    pub files_processed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }
}

/// Percent complete, clamped to 0-100. An empty workload is complete.
pub fn percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((processed.min(total) as f64 / total as f64) * 100.0).floor() as u8
}

/// Writes the progress record for one project cycle.
pub struct ProgressReporter {
    path: PathBuf,
    project: String,
    events: Option<EventBus>,
    state: Mutex<ReporterState>,
}

struct ReporterState {
    phase: Phase,
    total_files: usize,
    last_write: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(path: impl Into<PathBuf>, project: impl Into<String>, events: Option<EventBus>) -> Self {
        Self {
            path: path.into(),
            project: project.into(),
            events,
            state: Mutex::new(ReporterState {
                phase: Phase::Idle,
                total_files: 0,
                last_write: None,
            }),
        }
    }

    /// Enter `phase`. Always written.
    pub fn phase(&self, phase: Phase, total_files: usize) -> Result<()> {
        {
            let mut state = self.lock();
            state.phase = phase;
            state.total_files = total_files;
            state.last_write = Some(Instant::now());
        }
        if let Some(events) = &self.events {
            events.publish(DaemonEvent::PhaseChanged {
                project: self.project.clone(),
                phase,
            });
        }
        let initial = if phase == Phase::Idle { 100 } else { 0 };
        self.write(phase, initial, 0, total_files)
    }

    /// Report files processed in the current phase. Throttled; returns
    /// whether a write happened.
    pub fn update(&self, files_processed: usize) -> Result<bool> {
        let (phase, total) = {
            let mut state = self.lock();
            let due = state
                .last_write
                .map(|t| t.elapsed() >= UPDATE_INTERVAL)
                .unwrap_or(true);
            if !due && files_processed < state.total_files {
                return Ok(false);
            }
            state.last_write = Some(Instant::now());
            (state.phase, state.total_files)
        };

        let pct = percent(files_processed, total);
        if let Some(events) = &self.events {
            events.publish(DaemonEvent::Progress {
                project: self.project.clone(),
                phase,
                percent: pct,
                files_processed,
                total_files: total,
            });
        }
        self.write(phase, pct, files_processed, total)?;
        Ok(true)
    }

    pub fn current_phase(&self) -> Phase {
        self.lock().phase
    }

    fn write(&self, phase: Phase, percent: u8, files_processed: usize, total_files: usize) -> Result<()> {
        let record = ProgressRecord {
            percent,
            phase,
            total_files,
            files_processed,
            project: Some(self.project.clone()),
            updated_at: Utc::now(),
        };
        debug!(project = %self.project, phase = %phase, percent, "Progress");
        write_json_atomic(&self.path, &record)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReporterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", size, UNITS[unit])
}

/// Format a duration in seconds
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86_400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86_400, (seconds % 86_400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 10), 0);
        assert_eq!(percent(5, 10), 50);
        assert_eq!(percent(10, 10), 100);
        assert_eq!(percent(12, 10), 100);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 3), 33);
    }

    #[test]
    fn test_phase_change_writes_record() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("progress.json");
        let reporter = ProgressReporter::new(&path, "app", None);

        reporter.phase(Phase::Copying, 4)?;
        let record = ProgressRecord::load(&path)?.unwrap();
        assert_eq!(record.phase, Phase::Copying);
        assert_eq!(record.total_files, 4);
        assert_eq!(record.percent, 0);

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(raw["phase"], "copying");
        Ok(())
    }

    #[test]
    fn test_updates_are_throttled_but_completion_is_written() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("progress.json");
        let reporter = ProgressReporter::new(&path, "app", None);

        reporter.phase(Phase::Copying, 10)?;
        assert!(!reporter.update(1)?);
        assert!(reporter.update(10)?);
        assert_eq!(ProgressRecord::load(&path)?.unwrap().percent, 100);
        Ok(())
    }

    #[tokio::test]
    async fn test_events_published() -> Result<()> {
        let dir = TempDir::new()?;
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let reporter = ProgressReporter::new(dir.path().join("progress.json"), "app", Some(bus));

        reporter.phase(Phase::Scanning, 0)?;
        assert!(matches!(
            rx.recv().await.unwrap(),
            DaemonEvent::PhaseChanged { phase: Phase::Scanning, .. }
        ));
        Ok(())
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3665), "1h 1m");
        assert_eq!(format_duration(90_000), "1d 1h");
    }
}
