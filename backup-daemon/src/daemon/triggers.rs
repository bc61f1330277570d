//! Pause marker and trigger file.
//!
//! Editor and shell hooks request a cycle by touching the `trigger` file;
//! it may be empty (all projects) or hold `{"project": "<name>"}`. The
//! daemon consumes it between ticks. The `paused` marker stops scheduled
//! cycles until removed or until its optional expiry passes.

use crate::config::StatePaths;
use crate::utils::atomic::{read_json, write_json_atomic};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseMarker {
    pub paused_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl PauseMarker {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.until.map(|until| now >= until).unwrap_or(false)
    }
}

pub fn pause(paths: &StatePaths, minutes: Option<u64>, now: DateTime<Utc>) -> Result<PauseMarker> {
    let marker = PauseMarker {
        paused_at: now,
        until: minutes.map(|m| now + Duration::minutes(m as i64)),
    };
    write_json_atomic(&paths.paused_marker(), &marker)?;
    info!(until = ?marker.until, "Backups paused");
    Ok(marker)
}

/// Remove the pause marker. Returns whether one existed.
pub fn resume(paths: &StatePaths) -> Result<bool> {
    match fs::remove_file(paths.paused_marker()) {
        Ok(()) => {
            info!("Backups resumed");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Active pause, if any. An expired marker is removed.
pub fn pause_state(paths: &StatePaths, now: DateTime<Utc>) -> Option<PauseMarker> {
    let path = paths.paused_marker();
    if !path.exists() {
        return None;
    }
    let marker = match read_json::<PauseMarker>(&path) {
        Ok(Some(marker)) => marker,
        // Hand-made or empty marker: paused indefinitely
        _ => PauseMarker {
            paused_at: now,
            until: None,
        },
    };
    if marker.is_expired(now) {
        debug!("Pause expired");
        if let Err(e) = fs::remove_file(&path) {
            warn!("Failed to remove expired pause marker: {}", e);
        }
        return None;
    }
    Some(marker)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Project name; every enabled project when absent
    #[serde(default)]
    pub project: Option<String>,
}

pub fn request_trigger(paths: &StatePaths, project: Option<&str>) -> Result<()> {
    let request = TriggerRequest {
        project: project.map(str::to_string),
    };
    write_json_atomic(&paths.trigger_file(), &request)
}

/// Consume a pending trigger request.
pub fn take_trigger(paths: &StatePaths) -> Option<TriggerRequest> {
    let path = paths.trigger_file();
    let taken = path.with_extension("taken");
    // Rename first so a hook touching the file meanwhile starts a new request
    if fs::rename(&path, &taken).is_err() {
        return None;
    }
    let content = fs::read_to_string(&taken).unwrap_or_default();
    let _ = fs::remove_file(&taken);

    let request = if content.trim().is_empty() {
        TriggerRequest::default()
    } else {
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Unreadable trigger file, running all projects: {}", e);
            TriggerRequest::default()
        })
    };
    info!(project = ?request.project, "Trigger file consumed");
    Some(request)
}
