//! Backup cycle executor.
//!
//! Drives one project through
//! lock → detect → snapshot + databases → verify → manifest → cloud →
//! finalize, publishing every phase to the progress record, the heartbeat
//! and the event bus. The lock is released on every exit path.

pub mod manifest;
pub mod phase;
pub mod restore;
pub mod retention;
pub mod snapshot;

use crate::cloud::crypto::CloudKey;
use crate::cloud::remote::Remote;
use crate::cloud::{CloudPolicy, CloudSync, CloudTasks};
use crate::config::{ChangeDetectionMode, Config, ProjectPaths, StatePaths};
use crate::daemon::heartbeat::HeartbeatPublisher;
use crate::daemon::lock::LockManager;
use crate::database::{detect, DatabaseReport, DatabaseSnapshotManager, DetectOptions};
use crate::fs::changes::{ChangeDetector, ChangeSet, DetectionStrategy, DetectorState};
use crate::fs::critical::CriticalFiles;
use crate::fs::walker::WalkOptions;
use crate::registry::{Project, ProjectRegistry};
use crate::transfer::progress::{percent, ProgressReporter};
use crate::ws::{DaemonEvent, EventBus};
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use manifest::{ChangeSummary, ErrorRecord, Manifest, ManifestBuilder, Outcome};
use phase::Phase;
use serde::{Deserialize, Serialize};
use snapshot::{SnapshotEngine, SnapshotOptions, SnapshotReport};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Immutable inputs of one cycle, built once and passed by reference.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub config: Arc<Config>,
    pub project: Project,
    pub paths: ProjectPaths,
    pub state: StatePaths,
    pub started_at: DateTime<Utc>,
    pub cycle_id: String,
    pub pid: u32,
}

impl CycleContext {
    pub fn new(config: Arc<Config>, project: Project) -> Self {
        let paths = config.project_paths(&project.name);
        let state = config.state_paths();
        Self {
            config,
            project,
            paths,
            state,
            started_at: Utc::now(),
            cycle_id: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
        }
    }

    fn walk_options(&self) -> WalkOptions {
        WalkOptions::with_extra_excludes(&self.config.backup.exclude_dirs)
    }
}

/// What happened to the cloud upload of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CloudDisposition {
    Disabled,
    /// Cycle failed before a manifest was written
    NotAttempted,
    /// Running in the background
    Started,
    /// Previous upload for this project still running
    Deferred,
    Completed { success: bool },
    Failed { error: String },
}

/// Summary of one cycle, appended to `history.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub project: String,
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub files: usize,
    pub bytes: u64,
    pub copied: usize,
    pub archived: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub databases: usize,
    pub database_failures: usize,
    pub remote_databases: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_tools: Vec<String>,
    pub errors: usize,
    /// First fatal or accumulated error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub cloud: CloudDisposition,
    pub retention_removed: usize,
    pub duration_ms: u64,
}

impl CycleReport {
    fn new(ctx: &CycleContext) -> Self {
        Self {
            project: ctx.project.name.clone(),
            cycle_id: ctx.cycle_id.clone(),
            started_at: ctx.started_at,
            completed_at: ctx.started_at,
            outcome: Outcome::Failed,
            files: 0,
            bytes: 0,
            copied: 0,
            archived: 0,
            deleted: 0,
            skipped: 0,
            failed: 0,
            databases: 0,
            database_failures: 0,
            remote_databases: 0,
            missing_tools: Vec::new(),
            errors: 0,
            error: None,
            error_kind: None,
            cloud: CloudDisposition::NotAttempted,
            retention_removed: 0,
            duration_ms: 0,
        }
    }

    /// A manifest was written, whether or not every file made it.
    pub fn is_local_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success | Outcome::Partial)
    }
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another live cycle holds the project lock, or the previous
    /// upload still reads its snapshot
    Skipped { reason: String },
}

/// Phase and progress publishing for one cycle.
struct Telemetry {
    progress: ProgressReporter,
    heartbeat: Option<Arc<HeartbeatPublisher>>,
    total: AtomicUsize,
}

impl Telemetry {
    fn phase(&self, phase: Phase, total: usize) {
        let current = self.progress.current_phase();
        if !current.can_advance_to(phase) {
            warn!(from = %current, to = %phase, "Out-of-order phase transition");
        }
        self.total.store(total, Ordering::Relaxed);
        if let Err(e) = self.progress.phase(phase, total) {
            warn!("Failed to write progress: {}", e);
        }
        if let Some(hb) = &self.heartbeat {
            let pct = if phase == Phase::Idle { None } else { Some(0) };
            if let Err(e) = hb.phase(phase, pct) {
                warn!("Failed to write heartbeat: {}", e);
            }
        }
    }

    fn files_processed(&self, processed: usize) {
        match self.progress.update(processed) {
            Ok(true) => {
                if let Some(hb) = &self.heartbeat {
                    let pct = percent(processed, self.total.load(Ordering::Relaxed));
                    if let Err(e) = hb.progress(pct) {
                        debug!("Failed to write heartbeat progress: {}", e);
                    }
                }
            }
            Ok(false) => {}
            Err(e) => debug!("Failed to write progress: {}", e),
        }
    }
}

/// Result of the local phases.
struct LocalResult {
    manifest: Manifest,
    snapshot: SnapshotReport,
    databases: DatabaseReport,
}

/// Runs backup cycles.
#[derive(Clone)]
pub struct CycleExecutor {
    locks: LockManager,
    heartbeat: Option<Arc<HeartbeatPublisher>>,
    events: Option<EventBus>,
    cloud_tasks: CloudTasks,
}

impl CycleExecutor {
    pub fn new(state: &StatePaths) -> Self {
        Self {
            locks: LockManager::new(state.locks_dir()),
            heartbeat: None,
            events: None,
            cloud_tasks: CloudTasks::new(),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Arc<HeartbeatPublisher>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cloud_tasks(mut self, tasks: CloudTasks) -> Self {
        self.cloud_tasks = tasks;
        self
    }

    pub fn cloud_tasks(&self) -> &CloudTasks {
        &self.cloud_tasks
    }

    fn publish(&self, event: DaemonEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Run one cycle under the project lock.
    ///
    /// Returns `Skipped` when another live cycle holds the lock. Fatal
    /// failures after the lock is taken produce a `Failed` report rather
    /// than an error, so the lock and telemetry are always finalized.
    pub async fn run(&self, ctx: &CycleContext) -> Result<CycleOutcome> {
        let project = ctx.project.name.as_str();
        let lock = match self.locks.acquire(project) {
            Ok(lock) => lock,
            Err(e @ BackupError::LockHeld { .. }) => {
                info!(project = %project, "{}, skipping", e);
                self.publish(DaemonEvent::CycleSkipped {
                    project: project.to_string(),
                    reason: e.to_string(),
                });
                return Ok(CycleOutcome::Skipped { reason: e.to_string() });
            }
            Err(e) => return Err(e),
        };

        // A background upload still reads current/ for this project
        if self.cloud_tasks.is_running(project).await {
            let reason = "previous cloud upload still running".to_string();
            info!(project = %project, "{}, skipping", reason);
            if let Err(e) = lock.release() {
                warn!(project = %project, "Failed to release lock: {}", e);
            }
            self.publish(DaemonEvent::CycleSkipped {
                project: project.to_string(),
                reason: reason.clone(),
            });
            return Ok(CycleOutcome::Skipped { reason });
        }

        info!(project = %project, cycle = %ctx.cycle_id, "Backup cycle started");
        self.publish(DaemonEvent::CycleStarted {
            project: project.to_string(),
            cycle_id: ctx.cycle_id.clone(),
        });

        let telemetry = Arc::new(Telemetry {
            progress: ProgressReporter::new(ctx.state.progress(), project, self.events.clone()),
            heartbeat: self.heartbeat.clone(),
            total: AtomicUsize::new(0),
        });

        let mut report = CycleReport::new(ctx);
        match self.run_local(ctx, &telemetry).await {
            Ok(local) => {
                apply_local(&mut report, &local);
                report.cloud = self.start_cloud(ctx, &telemetry).await;
                telemetry.phase(Phase::Finalizing, 0);
                self.finalize(ctx, &mut report).await;
            }
            Err(e) => {
                error!(project = %project, "Backup cycle failed: {}", e);
                telemetry.phase(Phase::Error, 0);
                report.outcome = Outcome::Failed;
                report.errors += 1;
                report.error = Some(e.to_string());
                report.error_kind = Some(e.kind().to_string());
                telemetry.phase(Phase::Finalizing, 0);
            }
        }

        report.completed_at = Utc::now();
        report.duration_ms = (report.completed_at - ctx.started_at).num_milliseconds().max(0) as u64;
        if let Err(e) = append_history(&ctx.paths.history(), &report) {
            warn!(project = %project, "Failed to append cycle history: {}", e);
        }
        telemetry.phase(Phase::Idle, 0);

        if let Err(e) = lock.release() {
            warn!(project = %project, "Failed to release lock: {}", e);
        }

        self.publish(DaemonEvent::CycleCompleted {
            project: project.to_string(),
            outcome: report.outcome,
            files: report.files,
            archived: report.archived,
            databases: report.databases,
            errors: report.errors,
            duration_ms: report.duration_ms,
        });
        info!(
            project = %project,
            outcome = %report.outcome,
            files = report.files,
            copied = report.copied,
            archived = report.archived,
            databases = report.databases,
            duration_ms = report.duration_ms,
            "Backup cycle finished"
        );
        Ok(CycleOutcome::Completed(report))
    }

    /// Compute the change set without writing anything.
    pub async fn preview(&self, ctx: &CycleContext) -> Result<ChangeSet> {
        let critical = CriticalFiles::new(&ctx.config.backup.critical_patterns)?;
        detect_changes(ctx, critical).await
    }

    async fn run_local(&self, ctx: &CycleContext, telemetry: &Arc<Telemetry>) -> Result<LocalResult> {
        let config = &ctx.config;

        telemetry.phase(Phase::Initializing, 0);
        check_drive(config)?;
        if !ctx.project.path.is_dir() {
            return Err(BackupError::ConfigInvalid(format!(
                "project directory {} does not exist",
                ctx.project.path.display()
            )));
        }
        let critical = CriticalFiles::new(&config.backup.critical_patterns)?;
        tokio::fs::create_dir_all(ctx.paths.current()).await?;

        telemetry.phase(Phase::Scanning, 0);
        let scan_started = Utc::now();
        let changes = detect_changes(ctx, critical.clone()).await?;
        if let Some(reason) = &changes.fallback_reason {
            warn!(project = %ctx.project.name, "Change detection degraded: {}", reason);
        }

        telemetry.phase(Phase::Preparing, 0);
        let candidates = if config.database.enabled {
            let root = ctx.project.path.clone();
            let options = DetectOptions {
                env_files: config.database.env_files.clone(),
                include_running_servers: config.database.dump_running_servers,
                walk: ctx.walk_options(),
            };
            match tokio::task::spawn_blocking(move || detect(&root, &options)).await {
                Ok(Ok(candidates)) => candidates,
                Ok(Err(e)) => {
                    warn!(project = %ctx.project.name, "Database detection failed: {}", e);
                    Vec::new()
                }
                Err(e) => {
                    warn!(project = %ctx.project.name, "Database detection task failed: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let changed: BTreeSet<PathBuf> = changes.changed().cloned().collect();
        let total = changed.len() + changes.deleted.len();
        debug!(
            project = %ctx.project.name,
            changed = changed.len(),
            deleted = changes.deleted.len(),
            databases = candidates.len(),
            "Prepared cycle"
        );

        telemetry.phase(Phase::Copying, total);
        let engine = Arc::new(SnapshotEngine::new(
            ctx.project.path.clone(),
            ctx.paths.current(),
            ctx.paths.archived(),
            ctx.started_at,
            ctx.pid,
            SnapshotOptions {
                max_file_size: config.backup.max_file_size,
                allow_large_files: config.backup.allow_large_files,
            },
        ));
        let databases = DatabaseSnapshotManager::new(
            ctx.paths.root.clone(),
            ctx.paths.databases(),
            ctx.started_at,
            ctx.pid,
            config.database.compression_level,
        );
        let progress = Arc::clone(telemetry);
        let (snapshot, databases) = tokio::join!(
            engine.run(changed.clone(), &changes.deleted, move |n| progress.files_processed(n)),
            databases.snapshot_all(candidates),
        );
        let snapshot = snapshot?;

        telemetry.phase(Phase::Verifying, changed.len());
        let drifted = verify_copies(&ctx.project.path, &ctx.paths.current(), &changed);
        if drifted > 0 {
            info!(
                project = %ctx.project.name,
                files = drifted,
                "Files changed during the cycle, picked up next cycle"
            );
        }

        telemetry.phase(Phase::Manifest, 0);
        let outcome = if snapshot.failed == 0 && databases.failed() == 0 {
            Outcome::Success
        } else {
            Outcome::Partial
        };
        let manifest = build_manifest(ctx, critical, &changes, &snapshot, &databases, outcome).await?;
        manifest.write(&ctx.paths.manifest())?;

        let state = DetectorState {
            last_scan_started: Some(scan_started),
            git_head: changes.git_head.clone(),
        };
        state.save(&ctx.paths.detector_state())?;

        Ok(LocalResult {
            manifest,
            snapshot,
            databases,
        })
    }

    /// Start or run the upload for a written manifest.
    async fn start_cloud(&self, ctx: &CycleContext, telemetry: &Arc<Telemetry>) -> CloudDisposition {
        let cloud = &ctx.config.cloud;
        if !cloud.enabled {
            return CloudDisposition::Disabled;
        }
        let sync = match cloud_sync(ctx) {
            Ok(sync) => sync,
            Err(e) => {
                warn!(project = %ctx.project.name, "Cloud sync unavailable: {}", e);
                if let Some(hb) = &self.heartbeat {
                    if let Err(e) = hb.cloud_result(false, Utc::now()) {
                        warn!(project = %ctx.project.name, "Failed to write heartbeat: {}", e);
                    }
                }
                return CloudDisposition::Failed { error: e.to_string() };
            }
        };

        let upload = CloudUpload {
            sync,
            manifest: ctx.paths.manifest(),
            project: ctx.project.name.clone(),
            heartbeat: self.heartbeat.clone(),
            events: self.events.clone(),
        };

        if cloud.background {
            let events = self.events.clone();
            let project = ctx.project.name.clone();
            let sync = upload.sync.clone().with_phase_callback(Arc::new(move |phase| {
                if let Some(events) = &events {
                    events.publish(DaemonEvent::PhaseChanged {
                        project: project.clone(),
                        phase,
                    });
                }
            }));
            let upload = CloudUpload { sync, ..upload };
            if self.cloud_tasks.spawn(&ctx.project.name, async move {
                upload.run().await;
            })
            .await
            {
                CloudDisposition::Started
            } else {
                CloudDisposition::Deferred
            }
        } else {
            if self.cloud_tasks.is_running(&ctx.project.name).await {
                return CloudDisposition::Deferred;
            }
            let progress = Arc::clone(telemetry);
            let sync = upload
                .sync
                .clone()
                .with_phase_callback(Arc::new(move |phase| progress.phase(phase, 0)));
            CloudUpload { sync, ..upload }.run().await
        }
    }

    async fn finalize(&self, ctx: &CycleContext, report: &mut CycleReport) {
        let project = ctx.project.name.as_str();
        let completed = Utc::now();

        match ProjectRegistry::load(&ctx.state.registry()) {
            Ok(mut registry) => {
                if let Err(e) = registry.record_backup(project, completed) {
                    warn!(project = %project, "Failed to record backup in registry: {}", e);
                }
            }
            Err(e) => warn!("Failed to load project registry: {}", e),
        }
        if let Some(hb) = &self.heartbeat {
            if let Err(e) = hb.backup_succeeded(completed, report.files) {
                warn!("Failed to write heartbeat: {}", e);
            }
        }

        let paths = ctx.paths.clone();
        let retention = ctx.project.retention_or(ctx.config.retention);
        match tokio::task::spawn_blocking(move || retention::cleanup(&paths, retention, completed, false)).await {
            Ok(Ok(cleaned)) => report.retention_removed = cleaned.total_removed(),
            Ok(Err(e)) => warn!(project = %project, "Retention cleanup failed: {}", e),
            Err(e) => warn!(project = %project, "Retention cleanup task failed: {}", e),
        }
    }
}

/// One upload plus its result reporting.
struct CloudUpload {
    sync: CloudSync,
    manifest: PathBuf,
    project: String,
    heartbeat: Option<Arc<HeartbeatPublisher>>,
    events: Option<EventBus>,
}

impl CloudUpload {
    async fn run(self) -> CloudDisposition {
        let at = Utc::now();
        let (disposition, success, uploaded, failed) = match self.sync.sync(&self.manifest).await {
            Ok(record) => {
                let success = record.pending.is_empty();
                let uploaded = record.categories.values().map(|c| c.uploaded).sum();
                let failed = record.categories.values().map(|c| c.failed).sum();
                (CloudDisposition::Completed { success }, success, uploaded, failed)
            }
            Err(e) => {
                warn!(project = %self.project, "Cloud sync failed: {}", e);
                (CloudDisposition::Failed { error: e.to_string() }, false, 0, 0)
            }
        };
        if let Some(hb) = &self.heartbeat {
            if let Err(e) = hb.cloud_result(success, at) {
                warn!("Failed to write heartbeat: {}", e);
            }
        }
        if let Some(events) = &self.events {
            events.publish(DaemonEvent::CloudCompleted {
                project: self.project.clone(),
                success,
                uploaded,
                failed,
            });
        }
        disposition
    }
}

fn cloud_sync(ctx: &CycleContext) -> Result<CloudSync> {
    let cloud = &ctx.config.cloud;
    let remote = Remote::from_config(&cloud.remote)?;
    let key = if cloud.encrypt {
        Some(CloudKey::load(&cloud.key_file)?)
    } else {
        None
    };
    let name = ctx.project.name.as_str();
    Ok(CloudSync::new(
        name,
        ctx.paths.root.clone(),
        ctx.state.cloud_staging(name),
        ctx.state.cloud_record(name),
        remote,
        key,
        CloudPolicy::from_config(cloud),
        cloud.compression_level,
    ))
}

/// Fails with `DriveMissing` when the backup volume is required but absent.
pub fn check_drive(config: &Config) -> Result<()> {
    if !config.backup.require_mounted {
        return Ok(());
    }
    let root = &config.backup.root;
    let mount = root.parent().unwrap_or(root);
    if mount.is_dir() {
        Ok(())
    } else {
        Err(BackupError::DriveMissing(root.clone()))
    }
}

/// Change detection plus the critical-file inclusion policy.
async fn detect_changes(ctx: &CycleContext, critical: CriticalFiles) -> Result<ChangeSet> {
    let root = ctx.project.path.clone();
    let current = ctx.paths.current();
    let mode = ctx.config.backup.change_detection;
    let walk = ctx.walk_options();
    let state = DetectorState::load(&ctx.paths.detector_state())?;
    let previous = Manifest::load(&ctx.paths.manifest())?;

    tokio::task::spawn_blocking(move || -> Result<ChangeSet> {
        let detector = ChangeDetector {
            root: &root,
            current_dir: &current,
            mode,
            walk: &walk,
            state: &state,
            previous: previous.as_ref(),
        };
        let mut changes = detector.detect()?;

        // git status never reports ignored files
        if changes.strategy == DetectionStrategy::Git {
            for file in critical.find(&root, &walk)? {
                changes.insert_changed(file.relative_path, &current);
            }
        }
        Ok(changes)
    })
    .await
    .map_err(|e| BackupError::ChangeDetection(format!("detection task failed: {e}")))?
}

/// Count copied files whose source changed after the copy was written:
/// a different size, or a modification time newer than the copy's.
fn verify_copies(source_root: &Path, current_dir: &Path, changed: &BTreeSet<PathBuf>) -> usize {
    changed
        .iter()
        .filter(|relative| {
            let source = std::fs::symlink_metadata(source_root.join(relative));
            let copy = std::fs::metadata(current_dir.join(relative));
            match (source, copy) {
                (Ok(s), Ok(c)) if s.is_file() => {
                    let newer = match (s.modified(), c.modified()) {
                        (Ok(source_mtime), Ok(copy_mtime)) => source_mtime > copy_mtime,
                        _ => false,
                    };
                    s.len() != c.len() || newer
                }
                _ => false,
            }
        })
        .count()
}

async fn build_manifest(
    ctx: &CycleContext,
    critical: CriticalFiles,
    changes: &ChangeSet,
    snapshot: &SnapshotReport,
    databases: &DatabaseReport,
    outcome: Outcome,
) -> Result<Manifest> {
    let summary = ChangeSummary {
        strategy: changes.strategy,
        first_cycle: changes.first_cycle,
        copied: snapshot.copied,
        archived: snapshot.archived,
        deleted: snapshot.deleted,
        unchanged: snapshot.unchanged,
        skipped: snapshot.skipped,
        failed: snapshot.failed,
    };
    let mut errors: Vec<ErrorRecord> = snapshot.errors.clone();
    errors.extend(databases.errors.iter().cloned());

    let project = ctx.project.name.clone();
    let cycle_id = ctx.cycle_id.clone();
    let started_at = ctx.started_at;
    let current = ctx.paths.current();
    let previous = Manifest::load(&ctx.paths.manifest())?;
    let hash_files = ctx.config.backup.change_detection == ChangeDetectionMode::Hash;
    let entries = databases.entries.clone();
    let warnings = snapshot.warnings.clone();

    tokio::task::spawn_blocking(move || {
        ManifestBuilder::new(project, cycle_id, started_at, &critical)
            .previous(previous.as_ref())
            .hash_files(hash_files)
            .databases(entries)
            .changes(summary)
            .errors(errors)
            .warnings(warnings)
            .build(&current, outcome)
    })
    .await
    .map_err(|e| BackupError::Io(std::io::Error::other(format!("manifest task failed: {e}"))))?
}

fn apply_local(report: &mut CycleReport, local: &LocalResult) {
    report.outcome = local.manifest.outcome;
    report.files = local.manifest.totals.files;
    report.bytes = local.manifest.totals.bytes;
    report.copied = local.snapshot.copied;
    report.archived = local.snapshot.archived;
    report.deleted = local.snapshot.deleted;
    report.skipped = local.snapshot.skipped;
    report.failed = local.snapshot.failed;
    report.databases = local.databases.entries.len();
    report.database_failures = local.databases.failed();
    report.remote_databases = local.databases.remote.len();
    report.missing_tools = local.databases.missing_tools.clone();
    report.errors = local.manifest.errors.len();
    if let Some(first) = local.manifest.errors.first() {
        report.error = Some(first.message.clone());
        report.error_kind = Some(first.kind.clone());
    }
}

fn append_history(path: &Path, report: &CycleReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(report)?;
    line.push(b'\n');
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    Ok(())
}

/// Reports from `history.jsonl`, oldest first. Unparseable lines are skipped.
pub fn read_history(path: &Path) -> Result<Vec<CycleReport>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
