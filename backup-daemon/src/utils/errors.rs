//! Error types for the backup engine.
//!
//! Variants follow the failure taxonomy of a backup cycle. Some of them
//! (`LockHeld`, `SymlinkSkipped`, `FileTooLarge`) are outcomes rather than
//! faults and are never surfaced as cycle failures.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup already running for {project} (pid {pid})")]
    LockHeld { project: String, pid: u32 },

    #[error("Reclaimed stale lock for {project} left by pid {pid}")]
    StaleLock { project: String, pid: u32 },

    #[error("Lock error for {project}: {reason}")]
    Lock { project: String, reason: String },

    #[error("Required tool not installed: {tool}")]
    DependencyMissing { tool: String },

    #[error("Change detection failed: {0}")]
    ChangeDetection(String),

    #[error("Failed to copy {path}: {source}")]
    FileCopy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Skipped symbolic link: {0}")]
    SymlinkSkipped(PathBuf),

    #[error("Skipped {path}: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Database dump failed for {name}: {reason}")]
    DatabaseDump { name: String, reason: String },

    #[error("Verification failed for {path}: {reason}")]
    Verification { path: PathBuf, reason: String },

    #[error("Cloud upload failed: {0}")]
    CloudUpload(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Backup drive not available: {0}")]
    DriveMissing(PathBuf),

    #[error("No backup output could be written ({failed} files failed)")]
    NoOutput { failed: usize },

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("No version {version} of {path}")]
    VersionNotFound { path: PathBuf, version: String },

    #[error("Invalid path: {0}")]
    InvalidPath(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// Whether this error aborts the whole cycle rather than a single
    /// file or database.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackupError::Lock { .. }
                | BackupError::ConfigInvalid(_)
                | BackupError::DriveMissing(_)
                | BackupError::NoOutput { .. }
                | BackupError::ProjectNotFound(_)
                | BackupError::Io(_)
                | BackupError::Serialization(_)
        )
    }

    /// Stable tag recorded in manifests and failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::LockHeld { .. } => "lock_held",
            BackupError::StaleLock { .. } => "stale_lock",
            BackupError::Lock { .. } => "lock",
            BackupError::DependencyMissing { .. } => "dependency_missing",
            BackupError::ChangeDetection(_) => "change_detection_failure",
            BackupError::FileCopy { .. } => "file_copy_failure",
            BackupError::SymlinkSkipped(_) => "symlink_skipped",
            BackupError::FileTooLarge { .. } => "file_too_large",
            BackupError::DatabaseDump { .. } => "database_dump_failure",
            BackupError::Verification { .. } => "verification_failure",
            BackupError::CloudUpload(_) => "cloud_upload_failure",
            BackupError::Encryption(_) => "encryption",
            BackupError::ConfigInvalid(_) => "config_invalid",
            BackupError::DriveMissing(_) => "drive_missing",
            BackupError::NoOutput { .. } => "no_output",
            BackupError::ProjectNotFound(_) => "project_not_found",
            BackupError::VersionNotFound { .. } => "version_not_found",
            BackupError::InvalidPath(_) => "invalid_path",
            BackupError::Io(_) => "io",
            BackupError::Serialization(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
