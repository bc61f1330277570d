//! Configuration management for the backup daemon.
//!
//! Loads configuration from an optional TOML file with environment variable
//! overrides (`BACKUP_DAEMON__SECTION__KEY`). Every field has a default, so a
//! partial file is valid.

use crate::utils::atomic::write_atomic;
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "BACKUP_DAEMON";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub backup: BackupConfig,
    pub retention: RetentionConfig,
    pub database: DatabaseConfig,
    pub cloud: CloudConfig,
    pub watchdog: WatchdogConfig,
    pub notify: NotifyConfig,
    pub log: LogConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding locks, heartbeat, progress and registry files
    pub state_dir: PathBuf,

    /// How often the daemon checks whether projects are due
    pub tick_secs: u64,

    /// Interval between backups for projects without their own schedule
    pub default_interval_secs: u64,

    /// How often the trigger file is polled between ticks
    pub trigger_poll_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDetectionMode {
    /// Version-control diff when a repository is present, mtime scan otherwise
    Auto,
    Git,
    Mtime,
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Root directory receiving one subdirectory per project
    pub root: PathBuf,

    /// Fail cycles when the volume holding `root` is not mounted
    pub require_mounted: bool,

    /// Files above this size are skipped unless `allow_large_files` is set
    pub max_file_size: u64,

    pub allow_large_files: bool,

    /// Extra directory names excluded from scans
    pub exclude_dirs: Vec<String>,

    /// Extra glob patterns treated as critical files
    pub critical_patterns: Vec<String>,

    pub change_detection: ChangeDetectionMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub database_days: u32,
    pub file_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,

    /// Dump whole local servers found through running processes even when
    /// no connection string names a database
    pub dump_running_servers: bool,

    /// Configuration files scanned for connection strings
    pub env_files: Vec<String>,

    /// zstd level used for dump compression
    pub compression_level: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    Rclone,
    Http,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub kind: RemoteKind,

    /// rclone remote path, base URL, or directory depending on `kind`
    pub target: String,

    /// Bearer token for the http remote
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub enabled: bool,

    /// Upload database snapshots
    pub databases: bool,

    /// Upload critical files individually
    pub critical: bool,

    /// Upload a bundle of the whole current tree
    pub all_files: bool,

    /// Encrypt locally before upload
    pub encrypt: bool,
    pub key_file: PathBuf,

    /// Run uploads without blocking the local completion signal
    pub background: bool,

    pub compression_level: i32,

    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub interval_secs: u64,

    /// A heartbeat or watchdog record older than this is stale
    pub stale_after_secs: u64,

    pub backup_warning_hours: u64,
    pub backup_critical_hours: u64,

    /// Elapsed time without a successful cloud upload before the daemon
    /// reports `backups-stale`
    pub cloud_warning_hours: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Command invoked as `<command> <title> <body>` on state transitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log output (stdout, file)
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let state_dir = dirs::state_dir()
            .unwrap_or_else(|| home_dir().join(".local/state"))
            .join("backup-daemon");
        Self {
            state_dir,
            tick_secs: 60,
            default_interval_secs: 3600,
            trigger_poll_secs: 5,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: home_dir().join("Backups"),
            require_mounted: false,
            max_file_size: 100 * 1024 * 1024,
            allow_large_files: false,
            exclude_dirs: Vec::new(),
            critical_patterns: Vec::new(),
            change_detection: ChangeDetectionMode::Auto,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            database_days: 30,
            file_days: 60,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dump_running_servers: false,
            env_files: [".env", ".env.local", ".env.development", ".env.development.local"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            compression_level: 3,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            kind: RemoteKind::Rclone,
            target: String::new(),
            token: None,
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            databases: true,
            critical: true,
            all_files: false,
            encrypt: false,
            key_file: default_config_dir().join("cloud.key"),
            background: true,
            compression_level: 3,
            remote: RemoteConfig::default(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            stale_after_secs: 300,
            backup_warning_hours: 24,
            backup_critical_hours: 72,
            cloud_warning_hours: 24,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:9970".to_string(),
        }
    }
}

/// `<config_dir>/backup-daemon`
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home_dir().join(".config"))
        .join("backup-daemon")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

impl Config {
    /// Load configuration from a TOML file (if it exists) layered under
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);

        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_path()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BackupError::ConfigInvalid(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BackupError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file without environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| BackupError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration back as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| BackupError::ConfigInvalid(e.to_string()))?;
        write_atomic(path, content.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(BackupError::ConfigInvalid(msg.to_string()));

        if self.daemon.tick_secs == 0 {
            return invalid("daemon.tick_secs must be greater than zero");
        }
        if self.daemon.default_interval_secs == 0 {
            return invalid("daemon.default_interval_secs must be greater than zero");
        }
        if self.backup.root.as_os_str().is_empty() {
            return invalid("backup.root must be set");
        }
        if self.retention.database_days == 0 || self.retention.file_days == 0 {
            return invalid("retention days must be greater than zero");
        }
        if self.cloud.enabled && self.cloud.remote.target.trim().is_empty() {
            return invalid("cloud.remote.target is required when cloud sync is enabled");
        }
        if self.cloud.enabled && self.cloud.encrypt && self.cloud.key_file.as_os_str().is_empty() {
            return invalid("cloud.key_file is required when encryption is enabled");
        }
        if self.watchdog.backup_warning_hours > self.watchdog.backup_critical_hours {
            return invalid("watchdog.backup_warning_hours must not exceed backup_critical_hours");
        }
        if self.watchdog.stale_after_secs == 0 {
            return invalid("watchdog.stale_after_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn state_paths(&self) -> StatePaths {
        StatePaths::new(&self.daemon.state_dir)
    }

    pub fn project_paths(&self, project_name: &str) -> ProjectPaths {
        ProjectPaths::new(&self.backup.root, project_name)
    }
}

/// Files under the daemon state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn heartbeat(&self) -> PathBuf {
        self.root.join("heartbeat.json")
    }

    pub fn watchdog(&self) -> PathBuf {
        self.root.join("watchdog.json")
    }

    pub fn progress(&self) -> PathBuf {
        self.root.join("progress.json")
    }

    pub fn registry(&self) -> PathBuf {
        self.root.join("projects.json")
    }

    pub fn paused_marker(&self) -> PathBuf {
        self.root.join("paused")
    }

    pub fn trigger_file(&self) -> PathBuf {
        self.root.join("trigger")
    }

    pub fn failure_record(&self, project: &str) -> PathBuf {
        self.root.join("failures").join(format!("{project}.json"))
    }

    pub fn cloud_record(&self, project: &str) -> PathBuf {
        self.root.join("cloud").join(format!("{project}.json"))
    }

    pub fn cloud_staging(&self, project: &str) -> PathBuf {
        self.root.join("cloud-staging").join(project)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Layout of one project's backup destination.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
}

impl ProjectPaths {
    pub fn new(backup_root: &Path, project_name: &str) -> Self {
        Self {
            root: backup_root.join(project_name),
        }
    }

    /// Latest copy of every file
    pub fn current(&self) -> PathBuf {
        self.root.join("current")
    }

    /// Superseded file versions
    pub fn archived(&self) -> PathBuf {
        self.root.join("archived")
    }

    pub fn databases(&self) -> PathBuf {
        self.root.join("databases")
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn history(&self) -> PathBuf {
        self.root.join("history.jsonl")
    }

    pub fn detector_state(&self) -> PathBuf {
        self.root.join("state.json")
    }
}
