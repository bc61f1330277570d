//! backup-daemon - entry point
//!
//! `run` starts the daemon loop; every other subcommand is a one-shot
//! operator command working on the same state directory.

use anyhow::{anyhow, bail, Context, Result};
use backup_daemon::cloud::crypto::CloudKey;
use backup_daemon::cloud::record::CloudUploadRecord;
use backup_daemon::cloud::remote::Remote;
use backup_daemon::config::{default_config_path, Config, LogConfig, RemoteKind};
use backup_daemon::daemon::alerts::{FailureTracker, Notifier};
use backup_daemon::daemon::heartbeat::HeartbeatPublisher;
use backup_daemon::daemon::lock::{LockHandle, LockManager};
use backup_daemon::daemon::scheduler::{PassRequest, Scheduler};
use backup_daemon::daemon::triggers::{pause, pause_state, request_trigger, resume};
use backup_daemon::daemon::Daemon;
use backup_daemon::database::deps::{cloud_tools, missing_tools, required_tools, InstallPlan};
use backup_daemon::database::{detect, DetectOptions};
use backup_daemon::executor::restore::{list_versions, restore, RestoreRequest};
use backup_daemon::executor::retention::cleanup;
use backup_daemon::executor::{CycleContext, CycleExecutor};
use backup_daemon::fs::walker::WalkOptions;
use backup_daemon::registry::{Project, ProjectRegistry};
use backup_daemon::status::StatusReport;
use backup_daemon::transfer::progress::format_bytes;
use backup_daemon::utils;
use backup_daemon::BackupError;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::Confirm;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon loop
    Run,
    /// Back up now
    Now {
        #[arg(short, long)]
        project: Option<String>,
        /// Ignore the pause marker and schedules
        #[arg(long)]
        force: bool,
        /// Print the detected changes without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Show daemon and project status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Pause scheduled backups
    Pause {
        /// Resume automatically after this many minutes
        #[arg(short, long)]
        minutes: Option<u64>,
    },
    /// Resume scheduled backups
    Resume,
    /// Manage registered projects
    Project {
        #[command(subcommand)]
        action: ProjectCommand,
    },
    /// Cloud sync settings and state
    Cloud {
        #[command(subcommand)]
        action: CloudCommand,
    },
    /// List or restore file versions
    Restore {
        #[arg(short, long)]
        project: String,
        /// File path relative to the project root
        path: PathBuf,
        /// Version id from --list; the newest when absent
        #[arg(long)]
        version: Option<String>,
        /// Restore to this file or directory instead of the original location
        #[arg(long)]
        to: Option<PathBuf>,
        #[arg(long)]
        list: bool,
        #[arg(long)]
        dry_run: bool,
        /// Do not ask before replacing an existing file
        #[arg(long)]
        force: bool,
    },
    /// Apply retention to archived versions and database snapshots
    Cleanup {
        #[arg(short, long)]
        project: Option<String>,
        #[arg(long)]
        dry_run: bool,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },
    /// Install the external tools projects need
    Deps {
        /// Install without asking
        #[arg(short, long)]
        yes: bool,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    Add { path: PathBuf },
    Remove { project: String },
    Enable { project: String },
    Disable { project: String },
    List,
}

#[derive(Subcommand, Debug)]
enum CloudCommand {
    /// Configure the remote and write the configuration file
    Configure {
        #[arg(long, value_enum)]
        remote_kind: RemoteKindArg,
        #[arg(long)]
        target: String,
        #[arg(long)]
        encrypt: bool,
        /// Create a new encryption key at cloud.key_file
        #[arg(long)]
        generate_key: bool,
        /// Print the resulting configuration without saving
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the last upload of each project
    Status {
        #[arg(short, long)]
        project: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RemoteKindArg {
    Rclone,
    Http,
    Directory,
}

impl From<RemoteKindArg> for RemoteKind {
    fn from(kind: RemoteKindArg) -> Self {
        match kind {
            RemoteKindArg::Rclone => RemoteKind::Rclone,
            RemoteKindArg::Http => RemoteKind::Http,
            RemoteKindArg::Directory => RemoteKind::Directory,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    // One-shot commands log to the terminal; the daemon follows the config
    let is_daemon = matches!(args.command, Command::Run);
    let log = if is_daemon {
        config.log.clone()
    } else {
        LogConfig {
            level: "warn".to_string(),
            output: "stdout".to_string(),
        }
    };
    let level = args.log_level.as_deref().unwrap_or(&log.level).to_string();
    utils::logger::init(&level, &log, &config.state_paths().logs_dir(), "backup-daemon")?;

    match args.command {
        Command::Run => run_daemon(config).await,
        Command::Now {
            project,
            force,
            dry_run,
        } => now(config, project, force, dry_run).await,
        Command::Status { json } => status(&config, json),
        Command::Pause { minutes } => {
            let marker = pause(&config.state_paths(), minutes, Utc::now())?;
            match marker.until {
                Some(until) => println!("Backups paused until {}", until.format("%Y-%m-%d %H:%M UTC")),
                None => println!("Backups paused"),
            }
            Ok(())
        }
        Command::Resume => {
            if resume(&config.state_paths())? {
                println!("Backups resumed");
            } else {
                println!("Backups were not paused");
            }
            Ok(())
        }
        Command::Project { action } => project(&config, action),
        Command::Cloud { action } => cloud(config, args.config.as_deref(), action),
        Command::Restore {
            project,
            path,
            version,
            to,
            list,
            dry_run,
            force,
        } => {
            let request = RestoreRequest {
                relative: &path,
                version: version.as_deref(),
                to: to.as_deref(),
                dry_run,
            };
            restore_file(&config, &project, &request, list, force)
        }
        Command::Cleanup {
            project,
            dry_run,
            force,
        } => cleanup_projects(&config, project.as_deref(), dry_run, force),
        Command::Deps { yes, dry_run } => deps(&config, yes, dry_run),
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    tracing::info!("Starting backup-daemon v{}", env!("CARGO_PKG_VERSION"));
    let daemon = Daemon::new(Arc::new(config));
    let shutdown = daemon.shutdown();
    tokio::spawn(async move { shutdown.wait_for_signal().await });
    daemon.run().await?;
    Ok(())
}

fn load_registry(config: &Config) -> Result<ProjectRegistry> {
    Ok(ProjectRegistry::load(&config.state_paths().registry())?)
}

fn find_project(config: &Config, key: &str) -> Result<Project> {
    load_registry(config)?
        .get(key)
        .cloned()
        .ok_or_else(|| BackupError::ProjectNotFound(key.to_string()).into())
}

/// The running daemon's pid, if any.
fn daemon_pid(config: &Config) -> Option<u32> {
    let locks = LockManager::new(&config.state_paths().root);
    if locks.is_locked("daemon") {
        locks.holder("daemon").map(|meta| meta.pid)
    } else {
        None
    }
}

async fn now(config: Config, project: Option<String>, force: bool, dry_run: bool) -> Result<()> {
    let config = Arc::new(config);
    let state = config.state_paths();

    if dry_run {
        let projects = match &project {
            Some(key) => vec![find_project(&config, key)?],
            None => load_registry(&config)?.enabled().cloned().collect(),
        };
        let executor = CycleExecutor::new(&state);
        for project in projects {
            let ctx = CycleContext::new(Arc::clone(&config), project);
            let changes = executor.preview(&ctx).await?;
            println!(
                "{} ({}{}): {} modified, {} added, {} deleted",
                ctx.project.name,
                changes.strategy,
                if changes.first_cycle { ", first cycle" } else { "" },
                changes.modified.len(),
                changes.added.len(),
                changes.deleted.len()
            );
            for path in &changes.modified {
                println!("  M {}", path.display());
            }
            for path in &changes.added {
                println!("  A {}", path.display());
            }
            for path in &changes.deleted {
                println!("  D {}", path.display());
            }
            if let Some(reason) = &changes.fallback_reason {
                println!("  (full scan: {reason})");
            }
        }
        return Ok(());
    }

    // A running daemon owns the heartbeat; hand the request over
    if let Some(pid) = daemon_pid(&config) {
        if let Some(key) = &project {
            find_project(&config, key)?;
        }
        request_trigger(&state, project.as_deref())?;
        println!("Backup requested from the running daemon (pid {pid})");
        if force && pause_state(&state, Utc::now()).is_some() {
            println!("The daemon is paused; run `backup-daemon resume` to let it proceed");
        }
        return Ok(());
    }

    let heartbeat = Arc::new(HeartbeatPublisher::open(state.heartbeat(), None));
    let executor = CycleExecutor::new(&state).with_heartbeat(Arc::clone(&heartbeat));
    let failures = FailureTracker::new(&state, Notifier::from_config(&config.notify));
    let scheduler = Scheduler::new(Arc::clone(&config), executor, heartbeat, failures);

    let request = PassRequest {
        project,
        ignore_schedule: true,
        ignore_pause: force,
    };
    let summary = scheduler.run_pass(&request, &CancellationToken::new()).await?;
    scheduler.executor().cloud_tasks().join_all().await;

    if summary.paused {
        println!("Backups are paused; use --force to run anyway");
        return Ok(());
    }
    for report in &summary.reports {
        println!(
            "{}: {} · {} files · {} copied · {} archived · {} db{}",
            report.project,
            report.outcome,
            report.files,
            report.copied,
            report.archived,
            report.databases,
            report.error.as_deref().map(|e| format!(" · {e}")).unwrap_or_default()
        );
    }
    if summary.counters.skipped > 0 {
        println!("{} project(s) skipped, already running", summary.counters.skipped);
    }
    if !summary.is_success() {
        bail!("{} project(s) failed", summary.counters.failed);
    }
    Ok(())
}

fn status(config: &Config, json: bool) -> Result<()> {
    let report = StatusReport::collect(config, Utc::now())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }
    let code = report.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn project(config: &Config, action: ProjectCommand) -> Result<()> {
    let mut registry = load_registry(config)?;
    match action {
        ProjectCommand::Add { path } => {
            let project = registry.add(&path)?;
            println!("Added {} ({})", project.name, project.path.display());
        }
        ProjectCommand::Remove { project } => {
            let removed = registry.remove(&project)?;
            println!(
                "Removed {}; its backups remain under {}",
                removed.name,
                config.project_paths(&removed.name).root.display()
            );
        }
        ProjectCommand::Enable { project } => {
            registry.set_enabled(&project, true)?;
            println!("Enabled {project}");
        }
        ProjectCommand::Disable { project } => {
            registry.set_enabled(&project, false)?;
            println!("Disabled {project}");
        }
        ProjectCommand::List => {
            if registry.projects.is_empty() {
                println!("No projects registered. Add one with `backup-daemon project add <path>`.");
            }
            for p in &registry.projects {
                let last = p
                    .last_backup
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<20} {:<8} last {:<16} {}",
                    p.name,
                    if p.enabled { "enabled" } else { "disabled" },
                    last,
                    p.path.display()
                );
            }
        }
    }
    Ok(())
}

fn cloud(mut config: Config, config_path: Option<&Path>, action: CloudCommand) -> Result<()> {
    match action {
        CloudCommand::Configure {
            remote_kind,
            target,
            encrypt,
            generate_key,
            dry_run,
        } => {
            config.cloud.enabled = true;
            config.cloud.remote.kind = remote_kind.into();
            config.cloud.remote.target = target;
            config.cloud.encrypt = encrypt || generate_key;
            config.validate()?;
            let remote = Remote::from_config(&config.cloud.remote)?;

            if dry_run {
                println!("{}", toml::to_string_pretty(&config)?);
                println!("# remote: {}", remote.describe());
                return Ok(());
            }

            if generate_key {
                let key = CloudKey::generate();
                key.save_new(&config.cloud.key_file)?;
                println!(
                    "Generated key {} at {}. Keep a copy somewhere safe: uploads cannot be read without it.",
                    key.fingerprint(),
                    config.cloud.key_file.display()
                );
            } else if config.cloud.encrypt {
                let key = CloudKey::load(&config.cloud.key_file)
                    .with_context(|| "encryption enabled but no usable key; pass --generate-key")?;
                println!("Using key {}", key.fingerprint());
            }

            let path = config_path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
            config.save(&path)?;
            println!("Cloud sync to {} saved in {}", remote.describe(), path.display());
        }
        CloudCommand::Status { project } => {
            let state = config.state_paths();
            let projects = match &project {
                Some(key) => vec![find_project(&config, key)?],
                None => load_registry(&config)?.projects,
            };
            if !config.cloud.enabled {
                println!("Cloud sync is disabled");
            }
            for p in projects {
                let record = CloudUploadRecord::load(&state.cloud_record(&p.name), &p.name)?;
                let fmt = |t: Option<chrono::DateTime<Utc>>| {
                    t.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_string())
                };
                println!(
                    "{:<20} last success {} · last attempt {} · {} consecutive failure(s)",
                    p.name,
                    fmt(record.last_success),
                    fmt(record.last_attempt),
                    record.consecutive_failures
                );
                for (category, result) in &record.categories {
                    println!(
                        "    {:<10} {} uploaded · {} skipped · {} failed · {}{}",
                        category.as_str(),
                        result.uploaded,
                        result.skipped,
                        result.failed,
                        format_bytes(result.bytes),
                        result.error.as_deref().map(|e| format!(" · {e}")).unwrap_or_default()
                    );
                }
                if !record.pending.is_empty() {
                    let pending: Vec<&str> = record.pending.iter().map(|c| c.as_str()).collect();
                    println!("    pending: {}", pending.join(", "));
                }
            }
        }
    }
    Ok(())
}

/// Hold the project lock so nothing races a running cycle.
fn lock_project(config: &Config, project: &str) -> Result<LockHandle> {
    LockManager::new(config.state_paths().locks_dir())
        .acquire(project)
        .map_err(|e| match e {
            BackupError::LockHeld { pid, .. } => {
                anyhow!("a backup of {project} is running (pid {pid}); try again when it finishes")
            }
            other => other.into(),
        })
}

fn confirm(prompt: String) -> bool {
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false)
}

fn restore_file(config: &Config, key: &str, request: &RestoreRequest<'_>, list: bool, force: bool) -> Result<()> {
    let project = find_project(config, key)?;
    let paths = config.project_paths(&project.name);

    if list {
        let versions = list_versions(&paths, request.relative)?;
        if versions.is_empty() {
            println!("No versions of {}", request.relative.display());
        }
        for v in versions {
            println!(
                "{:<48} {:<8} {:>10}  {}",
                v.id,
                format!("{:?}", v.kind).to_lowercase(),
                format_bytes(v.size),
                v.at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        return Ok(());
    }

    let lock = lock_project(config, &project.name)?;
    let now = Utc::now();
    let pid = std::process::id();

    let plan = restore(&paths, &project.path, &RestoreRequest { dry_run: true, ..request.clone() }, now, pid)?;
    if plan.identical {
        println!("{} already matches version {}", plan.destination.display(), plan.version.id);
        lock.release()?;
        return Ok(());
    }
    if request.dry_run {
        println!(
            "Would restore {} ({}) to {}{}",
            request.relative.display(),
            plan.version.id,
            plan.destination.display(),
            if plan.archive_existing { ", archiving the existing file" } else { "" }
        );
        lock.release()?;
        return Ok(());
    }
    if plan.archive_existing
        && !force
        && !confirm(format!(
            "{} exists and will be archived before restoring. Continue?",
            plan.destination.display()
        ))
    {
        println!("Restore cancelled");
        lock.release()?;
        return Ok(());
    }

    let done = restore(&paths, &project.path, request, now, pid)?;
    lock.release()?;
    println!("Restored {} to {}", done.version.id, done.destination.display());
    if let Some(archived) = done.archived_to {
        println!("Previous content archived as {}", archived.display());
    }
    Ok(())
}

fn cleanup_projects(config: &Config, key: Option<&str>, dry_run: bool, force: bool) -> Result<()> {
    let projects = match key {
        Some(key) => vec![find_project(config, key)?],
        None => load_registry(config)?.projects,
    };
    let now = Utc::now();

    for project in projects {
        let paths = config.project_paths(&project.name);
        let retention = project.retention_or(config.retention);
        let lock = lock_project(config, &project.name)?;

        let preview = cleanup(&paths, retention, now, true)?;
        if preview.total_removed() == 0 {
            println!("{}: nothing to remove", project.name);
            lock.release()?;
            continue;
        }
        let summary = format!(
            "{}: {} archived version(s), {} database snapshot(s), {}",
            project.name,
            preview.archived_removed,
            preview.databases_removed,
            format_bytes(preview.bytes_freed)
        );
        if dry_run {
            println!("Would remove {summary}");
            lock.release()?;
            continue;
        }
        if !force && !confirm(format!("Remove {summary}?")) {
            println!("{}: skipped", project.name);
            lock.release()?;
            continue;
        }
        let report = cleanup(&paths, retention, now, false)?;
        lock.release()?;
        println!(
            "{}: removed {} file(s), freed {}",
            project.name,
            report.total_removed(),
            format_bytes(report.bytes_freed)
        );
    }
    Ok(())
}

fn deps(config: &Config, yes: bool, dry_run: bool) -> Result<()> {
    let registry = load_registry(config)?;
    let options = DetectOptions {
        env_files: config.database.env_files.clone(),
        include_running_servers: config.database.dump_running_servers,
        walk: WalkOptions::with_extra_excludes(&config.backup.exclude_dirs),
    };

    let mut engines = Vec::new();
    if config.database.enabled {
        for project in registry.enabled() {
            match detect(&project.path, &options) {
                Ok(candidates) => engines.extend(candidates.into_iter().filter(|c| c.is_local()).map(|c| c.engine)),
                Err(e) => eprintln!("{}: database detection failed: {}", project.name, e),
            }
        }
    }
    let mut tools = required_tools(engines);
    tools.extend(cloud_tools(config));

    let missing = missing_tools(&tools);
    if missing.is_empty() {
        println!("All required tools are installed");
        return Ok(());
    }
    println!("Missing: {}", missing.join(", "));

    let plan = InstallPlan::for_platform(&missing);
    if !plan.unresolved.is_empty() {
        println!("No known package for: {}", plan.unresolved.join(", "));
    }
    match plan.command_line() {
        Some(command) if dry_run => {
            println!("Would run: {command}");
            return Ok(());
        }
        Some(_) => {}
        None => bail!("no supported package manager found; install the tools manually"),
    }

    let installed = plan.execute(|plan| yes || confirm(format!("Run `{plan}`?")))?;
    if installed {
        println!("Installed {}", plan.packages.join(", "));
    }
    Ok(())
}
