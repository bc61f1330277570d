//! Multi-project passes.
//!
//! A pass walks the selected projects sequentially, one cycle and one lock
//! at a time, publishing aggregate counters to the heartbeat so every
//! project of the pass is individually observable. Cloud uploads of a
//! finished project may still be running while the next one starts.

use crate::config::{Config, StatePaths};
use crate::daemon::alerts::FailureTracker;
use crate::daemon::heartbeat::{HeartbeatPublisher, HeartbeatStatus, SyncCounters};
use crate::daemon::triggers::pause_state;
use crate::executor::{CycleContext, CycleExecutor, CycleOutcome, CycleReport};
use crate::registry::{Project, ProjectRegistry};
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which projects a pass covers.
#[derive(Debug, Clone, Default)]
pub struct PassRequest {
    /// One project by name or path; every enabled project when absent
    pub project: Option<String>,
    /// Run projects that are not due yet
    pub ignore_schedule: bool,
    /// Run even while paused
    pub ignore_pause: bool,
}

impl PassRequest {
    pub fn scheduled() -> Self {
        Self::default()
    }

    pub fn triggered(project: Option<String>) -> Self {
        Self {
            project,
            ignore_schedule: true,
            ignore_pause: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    pub counters: SyncCounters,
    pub reports: Vec<CycleReport>,
    /// Last failure of the pass
    pub error: Option<String>,
    pub paused: bool,
}

impl PassSummary {
    pub fn is_success(&self) -> bool {
        self.counters.failed == 0
    }
}

pub struct Scheduler {
    config: Arc<Config>,
    state: StatePaths,
    executor: CycleExecutor,
    heartbeat: Arc<HeartbeatPublisher>,
    failures: FailureTracker,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        executor: CycleExecutor,
        heartbeat: Arc<HeartbeatPublisher>,
        failures: FailureTracker,
    ) -> Self {
        let state = config.state_paths();
        Self {
            config,
            state,
            executor,
            heartbeat,
            failures,
        }
    }

    pub fn executor(&self) -> &CycleExecutor {
        &self.executor
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatPublisher> {
        &self.heartbeat
    }

    /// Reflect the pause marker in the heartbeat. Returns whether paused.
    pub fn sync_pause_status(&self, now: DateTime<Utc>) -> Result<bool> {
        let paused = pause_state(&self.state, now).is_some();
        let status = self.heartbeat.snapshot().status;
        if paused && status != HeartbeatStatus::Stopped {
            info!("Daemon paused");
            self.heartbeat.set_status(HeartbeatStatus::Stopped)?;
        } else if !paused && status == HeartbeatStatus::Stopped {
            info!("Daemon resumed");
            self.heartbeat.set_status(HeartbeatStatus::Healthy)?;
        }
        Ok(paused)
    }

    fn select(&self, request: &PassRequest, now: DateTime<Utc>) -> Result<Vec<Project>> {
        let registry = ProjectRegistry::load(&self.state.registry())?;
        if let Some(key) = &request.project {
            let project = registry
                .get(key)
                .cloned()
                .ok_or_else(|| BackupError::ProjectNotFound(key.clone()))?;
            return Ok(vec![project]);
        }
        let interval = self.config.daemon.default_interval_secs;
        Ok(registry
            .enabled()
            .filter(|p| request.ignore_schedule || p.is_due(now, interval))
            .cloned()
            .collect())
    }

    /// Run one pass. Stops between projects once `shutdown` is cancelled.
    pub async fn run_pass(&self, request: &PassRequest, shutdown: &CancellationToken) -> Result<PassSummary> {
        let now = Utc::now();
        let mut summary = PassSummary::default();

        if !request.ignore_pause && self.sync_pause_status(now)? {
            debug!("Paused, skipping pass");
            summary.paused = true;
            return Ok(summary);
        }

        let projects = self.select(request, now)?;
        if projects.is_empty() {
            self.heartbeat.touch()?;
            return Ok(summary);
        }

        info!(projects = projects.len(), "Backup pass started");
        self.heartbeat.begin_pass(projects.len())?;

        for (index, project) in projects.into_iter().enumerate() {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, ending pass early");
                break;
            }
            self.heartbeat.begin_project(index + 1, &project.name, summary.counters)?;

            let ctx = CycleContext::new(Arc::clone(&self.config), project);
            match self.executor.run(&ctx).await {
                Ok(CycleOutcome::Completed(report)) => {
                    if let Err(e) = self.failures.observe(&report).await {
                        warn!(project = %report.project, "Failed to update failure record: {}", e);
                    }
                    if report.is_local_success() {
                        summary.counters.backed_up += 1;
                    } else {
                        summary.counters.failed += 1;
                    }
                    if !report.missing_tools.is_empty() {
                        summary.error = Some(format!(
                            "{}: missing tools {} (run `backup-daemon deps`)",
                            report.project,
                            report.missing_tools.join(", ")
                        ));
                    } else if let Some(error) = &report.error {
                        summary.error = Some(format!("{}: {}", report.project, error));
                    }
                    summary.reports.push(report);
                }
                Ok(CycleOutcome::Skipped { .. }) => summary.counters.skipped += 1,
                Err(e) => {
                    warn!(project = %ctx.project.name, "Cycle could not start: {}", e);
                    summary.counters.failed += 1;
                    summary.error = Some(format!("{}: {}", ctx.project.name, e));
                }
            }
        }

        self.heartbeat.update(|hb| {
            hb.syncing_backed_up = Some(summary.counters.backed_up);
            hb.syncing_failed = Some(summary.counters.failed);
            hb.syncing_skipped = Some(summary.counters.skipped);
        })?;
        self.heartbeat.end_pass(summary.error.clone())?;
        info!(
            backed_up = summary.counters.backed_up,
            failed = summary.counters.failed,
            skipped = summary.counters.skipped,
            "Backup pass finished"
        );
        Ok(summary)
    }
}
