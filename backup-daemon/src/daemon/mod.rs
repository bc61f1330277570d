//! Long-running daemon.
//!
//! One process per user, guarded by a singleton lock in the state
//! directory. The loop wakes on the schedule tick, on the trigger file and
//! on API trigger requests, and runs one pass at a time. Shutdown lets the
//! running cycle finish, then waits a bounded time for cloud uploads.

pub mod alerts;
pub mod heartbeat;
pub mod lock;
pub mod scheduler;
pub mod shutdown;
pub mod triggers;
pub mod watchdog;

use crate::api::{create_router, AppState};
use crate::cloud::CloudTasks;
use crate::config::Config;
use crate::executor::CycleExecutor;
use crate::ws::EventBus;
use crate::{BackupError, Result};
use alerts::{FailureTracker, Notifier};
use chrono::Utc;
use heartbeat::{HeartbeatPublisher, HeartbeatStatus};
use lock::LockManager;
use scheduler::{PassRequest, Scheduler};
use shutdown::ShutdownCoordinator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use triggers::{take_trigger, TriggerRequest};

/// How long shutdown waits for background uploads
const CLOUD_GRACE: Duration = Duration::from_secs(30);

/// Upper bound between heartbeat writes while a cycle runs
const KEEPALIVE_MAX: Duration = Duration::from_secs(30);

/// Queued API trigger requests
const TRIGGER_QUEUE: usize = 16;

pub struct Daemon {
    config: Arc<Config>,
    shutdown: ShutdownCoordinator,
    events: EventBus,
}

impl Daemon {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            shutdown: ShutdownCoordinator::new(),
            events: EventBus::new(),
        }
    }

    pub fn shutdown(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        let state = self.config.state_paths();
        std::fs::create_dir_all(&state.root)?;

        let singleton = match LockManager::new(&state.root).acquire("daemon") {
            Ok(handle) => handle,
            Err(BackupError::LockHeld { pid, .. }) => {
                return Err(BackupError::Lock {
                    project: "daemon".to_string(),
                    reason: format!("another daemon is running (pid {pid})"),
                })
            }
            Err(e) => return Err(e),
        };

        let project_locks = LockManager::new(state.locks_dir());
        for name in project_locks.reclaim_stale()? {
            warn!(project = %name, "Reclaimed lock left by a dead process");
        }

        let heartbeat = Arc::new(HeartbeatPublisher::open(state.heartbeat(), Some(self.events.clone())));
        heartbeat.update(|hb| {
            hb.status = HeartbeatStatus::Healthy;
            hb.error = None;
            hb.phase = None;
            hb.percent = None;
        })?;

        let token = self.shutdown.token();
        let cloud_tasks = CloudTasks::new();
        let executor = CycleExecutor::new(&state)
            .with_heartbeat(Arc::clone(&heartbeat))
            .with_events(self.events.clone())
            .with_cloud_tasks(cloud_tasks.clone());
        let failures = FailureTracker::new(&state, Notifier::from_config(&self.config.notify));
        let scheduler = Scheduler::new(Arc::clone(&self.config), executor, Arc::clone(&heartbeat), failures);

        let keepalive = spawn_keepalive(Arc::clone(&heartbeat), self.keepalive_period(), token.clone());

        let (trigger_tx, mut trigger_rx) = mpsc::channel::<TriggerRequest>(TRIGGER_QUEUE);
        let server = if self.config.api.enabled {
            let app_state = AppState::new(Arc::clone(&self.config), self.events.clone(), trigger_tx.clone());
            spawn_api(&self.config.api.bind, app_state, token.clone()).await
        } else {
            None
        };

        info!(
            pid = std::process::id(),
            state_dir = %state.root.display(),
            "Backup daemon started"
        );

        let mut tick = tokio::time::interval(Duration::from_secs(self.config.daemon.tick_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(Duration::from_secs(self.config.daemon.trigger_poll_secs.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let request = tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => Some(PassRequest::scheduled()),
                _ = poll.tick() => {
                    if let Err(e) = scheduler.sync_pause_status(Utc::now()) {
                        warn!("Failed to update pause status: {}", e);
                    }
                    take_trigger(&state).map(|t| PassRequest::triggered(t.project))
                }
                Some(t) = trigger_rx.recv() => Some(PassRequest::triggered(t.project)),
            };
            let Some(request) = request else {
                continue;
            };

            match scheduler.run_pass(&request, &token).await {
                Ok(summary) if !summary.is_success() => {
                    warn!(failed = summary.counters.failed, "Pass finished with failures");
                }
                Ok(_) => {}
                Err(BackupError::ProjectNotFound(name)) => {
                    warn!(project = %name, "Trigger for unknown project ignored");
                }
                Err(e) => {
                    error!("Pass failed: {}", e);
                    if let Err(e) = heartbeat.update(|hb| {
                        hb.status = HeartbeatStatus::Error;
                        hb.error = Some(e.to_string());
                    }) {
                        warn!("Failed to write heartbeat: {}", e);
                    }
                }
            }
        }

        info!("Shutting down");
        let running = cloud_tasks.running_count().await;
        if running > 0 {
            info!(uploads = running, "Waiting for cloud uploads");
            if tokio::time::timeout(CLOUD_GRACE, cloud_tasks.join_all()).await.is_err() {
                warn!("Cloud uploads still running after {}s, abandoning", CLOUD_GRACE.as_secs());
            }
        }

        let _ = keepalive.await;
        if let Some(server) = server {
            match tokio::time::timeout(Duration::from_secs(5), server).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("API task failed: {}", e),
                Err(_) => warn!("API shutdown timeout"),
            }
        }

        heartbeat.update(|hb| {
            hb.status = HeartbeatStatus::Stopped;
            hb.project = None;
            hb.phase = None;
            hb.percent = None;
        })?;
        singleton.release()?;
        info!("Backup daemon stopped");
        Ok(())
    }

    fn keepalive_period(&self) -> Duration {
        let stale = Duration::from_secs((self.config.watchdog.stale_after_secs / 3).max(1));
        stale.min(KEEPALIVE_MAX)
    }
}

/// Touch the heartbeat on a fixed period so long cycles never look stale.
fn spawn_keepalive(
    heartbeat: Arc<HeartbeatPublisher>,
    period: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = heartbeat.touch() {
                        warn!("Failed to write heartbeat: {}", e);
                    }
                }
            }
        }
    })
}

async fn spawn_api(bind: &str, state: AppState, token: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("API disabled, cannot bind {}: {}", bind, e);
            return None;
        }
    };
    info!("API listening on http://{}", bind);
    let app = create_router(state);
    Some(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            error!("API server error: {}", e);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChangeDetectionMode;
    use crate::registry::ProjectRegistry;
    use super::heartbeat::Heartbeat;
    use std::fs;
    use tempfile::TempDir;

    fn config(backups: &TempDir, state: &TempDir) -> Arc<Config> {
        let mut config = Config::default();
        config.backup.root = backups.path().to_path_buf();
        config.backup.change_detection = ChangeDetectionMode::Mtime;
        config.daemon.state_dir = state.path().to_path_buf();
        config.daemon.trigger_poll_secs = 1;
        config.database.enabled = false;
        config.api.enabled = false;
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_runs_due_projects_then_stops() -> Result<()> {
        let backups = TempDir::new()?;
        let state = TempDir::new()?;
        let source = TempDir::new()?;
        fs::write(source.path().join("main.rs"), "fn main() {}")?;
        let config = config(&backups, &state);
        ProjectRegistry::load(&config.state_paths().registry())?.add(source.path())?;

        let daemon = Daemon::new(Arc::clone(&config));
        let shutdown = daemon.shutdown();
        let handle = tokio::spawn(daemon.run());

        let heartbeat_path = config.state_paths().heartbeat();
        let backed_up = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                if let Ok(Some(hb)) = Heartbeat::load(&heartbeat_path) {
                    if hb.last_backup.is_some() {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(backed_up.is_ok());

        shutdown.trigger();
        handle.await.unwrap()?;

        let hb = Heartbeat::load(&heartbeat_path)?.unwrap();
        assert_eq!(hb.status, HeartbeatStatus::Stopped);
        assert!(!LockManager::new(&config.state_paths().root).is_locked("daemon"));
        Ok(())
    }

    #[tokio::test]
    async fn test_second_daemon_refused() -> Result<()> {
        let backups = TempDir::new()?;
        let state = TempDir::new()?;
        let config = config(&backups, &state);
        let held = LockManager::new(state.path()).acquire("daemon")?;

        let err = Daemon::new(config).run().await.unwrap_err();
        assert!(matches!(err, BackupError::Lock { .. }));
        held.release()?;
        Ok(())
    }
}
