//! backup-watchdog - independent liveness supervisor
//!
//! Runs beside the daemon (launchd/systemd keeps it alive) and checks the
//! daemon's heartbeat every `watchdog.interval_secs`.

use anyhow::{Context, Result};
use backup_daemon::config::Config;
use backup_daemon::daemon::shutdown::ShutdownCoordinator;
use backup_daemon::daemon::watchdog::Watchdog;
use backup_daemon::utils;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Check once and exit non-zero when the daemon is unhealthy
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    let level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(level, &config.log, &config.state_paths().logs_dir(), "backup-watchdog")?;

    let watchdog = Watchdog::new(&config);

    if args.once {
        let check = watchdog.tick(Utc::now()).await?;
        println!("daemon: {}", check.daemon);
        if let Some(severity) = check.backups_overdue {
            println!("backups overdue: {severity:?}");
        }
        if check.cloud_overdue {
            println!("cloud uploads overdue");
        }
        if !check.daemon.is_unhealthy() {
            return Ok(());
        }
        std::process::exit(1);
    }

    info!(
        "Starting backup-watchdog v{} (every {}s)",
        env!("CARGO_PKG_VERSION"),
        watchdog.interval().as_secs()
    );

    let shutdown = ShutdownCoordinator::new();
    let token = shutdown.token();
    tokio::spawn(async move { shutdown.wait_for_signal().await });

    let mut interval = tokio::time::interval(watchdog.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                match watchdog.tick(Utc::now()).await {
                    Ok(check) if check.is_healthy() => {}
                    Ok(check) => warn!(daemon = %check.daemon, "Daemon unhealthy"),
                    Err(e) => warn!("Watchdog check failed: {}", e),
                }
            }
        }
    }

    info!("backup-watchdog stopped");
    Ok(())
}
