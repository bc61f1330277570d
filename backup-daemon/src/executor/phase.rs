//! Cycle phases.
//!
//! A cycle moves strictly forward through
//! `idle → initializing → scanning → preparing → copying → verifying →
//! manifest → cloud_syncing* → finalizing → idle`. `error` can be entered
//! from any phase and is followed only by `finalizing`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Initializing,
    Scanning,
    Preparing,
    Copying,
    Verifying,
    Manifest,
    CloudSyncing,
    CloudSyncingDatabases,
    CloudSyncingFiles,
    CloudSyncingArchives,
    CloudSyncingEncrypting,
    Finalizing,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Initializing => "initializing",
            Phase::Scanning => "scanning",
            Phase::Preparing => "preparing",
            Phase::Copying => "copying",
            Phase::Verifying => "verifying",
            Phase::Manifest => "manifest",
            Phase::CloudSyncing => "cloud_syncing",
            Phase::CloudSyncingDatabases => "cloud_syncing_databases",
            Phase::CloudSyncingFiles => "cloud_syncing_files",
            Phase::CloudSyncingArchives => "cloud_syncing_archives",
            Phase::CloudSyncingEncrypting => "cloud_syncing_encrypting",
            Phase::Finalizing => "finalizing",
            Phase::Error => "error",
        }
    }

    /// Position in the cycle. Cloud sub-phases share one slot since they
    /// may run in any order relative to each other.
    fn rank(&self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Initializing => 1,
            Phase::Scanning => 2,
            Phase::Preparing => 3,
            Phase::Copying => 4,
            Phase::Verifying => 5,
            Phase::Manifest => 6,
            Phase::CloudSyncing
            | Phase::CloudSyncingDatabases
            | Phase::CloudSyncingFiles
            | Phase::CloudSyncingArchives
            | Phase::CloudSyncingEncrypting => 7,
            Phase::Finalizing => 8,
            Phase::Error => 9,
        }
    }

    pub fn is_cloud(&self) -> bool {
        self.rank() == 7
    }

    /// Whether moving from `self` to `next` respects cycle ordering.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        match (self, next) {
            (Phase::Finalizing, Phase::Idle) => true,
            (Phase::Error, Phase::Finalizing) => true,
            (Phase::Error, _) => false,
            (Phase::Finalizing, _) | (Phase::Idle, Phase::Error) => false,
            (_, Phase::Error) => true,
            (current, next) if current.is_cloud() && next.is_cloud() => true,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_names() {
        assert_eq!(serde_json::to_string(&Phase::CloudSyncingDatabases).unwrap(), "\"cloud_syncing_databases\"");
        assert_eq!(serde_json::to_string(&Phase::Idle).unwrap(), "\"idle\"");
        for phase in [Phase::Scanning, Phase::CloudSyncingEncrypting, Phase::Error] {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json.trim_matches('"'), phase.as_str());
        }
    }

    #[test]
    fn test_forward_only() {
        assert!(Phase::Idle.can_advance_to(Phase::Initializing));
        assert!(Phase::Copying.can_advance_to(Phase::Verifying));
        assert!(Phase::Manifest.can_advance_to(Phase::Finalizing));
        assert!(!Phase::Verifying.can_advance_to(Phase::Copying));
        assert!(!Phase::Finalizing.can_advance_to(Phase::Copying));
        assert!(Phase::Finalizing.can_advance_to(Phase::Idle));
    }

    #[test]
    fn test_cloud_sub_phases() {
        assert!(Phase::Manifest.can_advance_to(Phase::CloudSyncingDatabases));
        assert!(Phase::CloudSyncingDatabases.can_advance_to(Phase::CloudSyncingEncrypting));
        assert!(Phase::CloudSyncingEncrypting.can_advance_to(Phase::CloudSyncingFiles));
        assert!(!Phase::CloudSyncingFiles.can_advance_to(Phase::Manifest));
    }

    #[test]
    fn test_error_goes_to_finalizing() {
        assert!(Phase::Scanning.can_advance_to(Phase::Error));
        assert!(Phase::Error.can_advance_to(Phase::Finalizing));
        assert!(!Phase::Error.can_advance_to(Phase::Idle));
        assert!(!Phase::Error.can_advance_to(Phase::Copying));
    }
}
