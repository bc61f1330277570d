//! Registry of protected project directories.
//!
//! Persisted as `projects.json` in the state directory and mutated only
//! through add/remove/toggle operations, each of which rewrites the file
//! atomically.

use crate::config::RetentionConfig;
use crate::utils::atomic::{read_json, write_json_atomic};
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Minimum seconds between two scheduled cycles
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub path: PathBuf,
    pub enabled: bool,
    #[serde(default)]
    pub last_backup: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    pub added_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            enabled: true,
            last_backup: None,
            retention: None,
            schedule: None,
            added_at: Utc::now(),
        }
    }

    /// Retention policy, falling back to the global default.
    pub fn retention_or(&self, default: RetentionConfig) -> RetentionConfig {
        self.retention.unwrap_or(default)
    }

    /// Whether a scheduled cycle is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>, default_interval_secs: u64) -> bool {
        let interval = self
            .schedule
            .as_ref()
            .map(|s| s.interval_secs)
            .unwrap_or(default_interval_secs);
        match self.last_backup {
            None => true,
            Some(last) => (now - last).num_seconds() >= interval as i64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectRegistry {
    pub projects: Vec<Project>,
    #[serde(skip)]
    path: PathBuf,
}

impl ProjectRegistry {
    /// Load the registry, starting empty when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        let mut registry: ProjectRegistry = read_json(path)?.unwrap_or_default();
        registry.path = path.to_path_buf();
        Ok(registry)
    }

    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, self)
    }

    /// Register a directory. The name derives from the directory name and
    /// gets a numeric suffix when it collides with an existing project.
    pub fn add(&mut self, path: &Path) -> Result<&Project> {
        let path = path.canonicalize().map_err(|e| {
            BackupError::ConfigInvalid(format!("cannot register {}: {}", path.display(), e))
        })?;
        if !path.is_dir() {
            return Err(BackupError::ConfigInvalid(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        if self.projects.iter().any(|p| p.path == path) {
            return Err(BackupError::ConfigInvalid(format!(
                "{} is already registered",
                path.display()
            )));
        }

        let base = sanitize_name(
            &path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string()),
        );
        let mut name = base.clone();
        let mut n = 2;
        while self.projects.iter().any(|p| p.name == name) {
            name = format!("{base}-{n}");
            n += 1;
        }

        self.projects.push(Project::new(name, path));
        self.save()?;
        let added = self.projects.len() - 1;
        Ok(&self.projects[added])
    }

    /// Remove a project by name or path.
    pub fn remove(&mut self, key: &str) -> Result<Project> {
        let idx = self.position(key)?;
        let removed = self.projects.remove(idx);
        self.save()?;
        Ok(removed)
    }

    pub fn set_enabled(&mut self, key: &str, enabled: bool) -> Result<()> {
        let idx = self.position(key)?;
        self.projects[idx].enabled = enabled;
        self.save()
    }

    pub fn record_backup(&mut self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let idx = self.position(name)?;
        self.projects[idx].last_backup = Some(at);
        self.save()
    }

    pub fn get(&self, key: &str) -> Option<&Project> {
        self.position(key).ok().map(|idx| &self.projects[idx])
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Project> {
        self.projects.iter().filter(|p| p.enabled)
    }

    fn position(&self, key: &str) -> Result<usize> {
        self.projects
            .iter()
            .position(|p| p.name == key || p.path == Path::new(key))
            .ok_or_else(|| BackupError::ProjectNotFound(key.to_string()))
    }
}

fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "project".to_string()
    } else {
        trimmed.to_string()
    }
}
