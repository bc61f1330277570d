//! Change detection.
//!
//! Determines which project files changed since the previous cycle. With a
//! git work tree the detector combines `git status` (staged, unstaged and
//! untracked) with a diff against the HEAD recorded by the previous cycle,
//! so commits made between cycles are not missed. Without one it scans the
//! tree and compares modification times, or content hashes when configured.
//!
//! The first cycle of a project (nothing in `current/` yet) reports every
//! file as added regardless of strategy.

use crate::config::ChangeDetectionMode;
use crate::executor::manifest::Manifest;
use crate::fs::metadata::sha256_file;
use crate::fs::walker::{is_effectively_empty, walk_directory, WalkOptions};
use crate::utils::atomic::{read_json, write_json_atomic};
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStrategy {
    Git,
    Mtime,
    Hash,
    /// Every file is a candidate; used on the first cycle and after a
    /// detection failure
    Full,
}

impl std::fmt::Display for DetectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DetectionStrategy::Git => "git",
            DetectionStrategy::Mtime => "mtime",
            DetectionStrategy::Hash => "hash",
            DetectionStrategy::Full => "full",
        };
        f.write_str(name)
    }
}

/// Paths relative to the project root.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub modified: BTreeSet<PathBuf>,
    pub added: BTreeSet<PathBuf>,
    pub deleted: BTreeSet<PathBuf>,
    pub strategy: DetectionStrategy,
    pub first_cycle: bool,
    /// Set when the configured strategy failed and a full scan was used
    pub fallback_reason: Option<String>,
    /// HEAD observed during detection, recorded for the next cycle
    pub git_head: Option<String>,
}

impl ChangeSet {
    fn new(strategy: DetectionStrategy) -> Self {
        Self {
            modified: BTreeSet::new(),
            added: BTreeSet::new(),
            deleted: BTreeSet::new(),
            strategy,
            first_cycle: false,
            fallback_reason: None,
            git_head: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modified.len() + self.added.len() + self.deleted.len()
    }

    /// Added and modified paths, in order.
    pub fn changed(&self) -> impl Iterator<Item = &PathBuf> {
        self.added.iter().chain(self.modified.iter())
    }

    /// Record a changed path, classified by whether a current copy exists.
    pub fn insert_changed(&mut self, relative: PathBuf, current_dir: &Path) {
        if self.deleted.contains(&relative) {
            return;
        }
        if current_dir.join(&relative).exists() {
            self.added.remove(&relative);
            self.modified.insert(relative);
        } else if !self.modified.contains(&relative) {
            self.added.insert(relative);
        }
    }
}

/// State carried between cycles in the project's `state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorState {
    /// When the last completed cycle started scanning. Files modified after
    /// this instant are changed; using the start rather than the end keeps
    /// edits made during a cycle from slipping through.
    pub last_scan_started: Option<DateTime<Utc>>,
    pub git_head: Option<String>,
}

impl DetectorState {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(read_json(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}

pub struct ChangeDetector<'a> {
    pub root: &'a Path,
    pub current_dir: &'a Path,
    pub mode: ChangeDetectionMode,
    pub walk: &'a WalkOptions,
    pub state: &'a DetectorState,
    pub previous: Option<&'a Manifest>,
}

impl<'a> ChangeDetector<'a> {
    /// Compute the change set. Never fails on strategy problems: a failing
    /// git or hash pass falls back to a full scan and records the reason.
    pub fn detect(&self) -> Result<ChangeSet> {
        if is_effectively_empty(self.current_dir) {
            info!(root = %self.root.display(), "No previous snapshot, treating every file as changed");
            let mut changes = self.full_scan(DetectionStrategy::Full)?;
            changes.first_cycle = true;
            changes.git_head = git_head(self.root);
            return Ok(changes);
        }

        let strategy = self.select_strategy();
        let result = match strategy {
            DetectionStrategy::Git => self.detect_git(),
            DetectionStrategy::Hash => self.detect_hash(),
            _ => self.detect_mtime(),
        };

        let mut changes = match result {
            Ok(changes) => changes,
            Err(e) => {
                let failure = BackupError::ChangeDetection(e.to_string());
                warn!(root = %self.root.display(), "{}, falling back to full scan", failure);
                let mut changes = self.full_scan(DetectionStrategy::Full)?;
                changes.fallback_reason = Some(failure.to_string());
                changes.git_head = git_head(self.root);
                changes
            }
        };

        self.add_manifest_deletions(&mut changes);
        debug!(
            strategy = %changes.strategy,
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "Change detection complete"
        );
        Ok(changes)
    }

    fn select_strategy(&self) -> DetectionStrategy {
        match self.mode {
            ChangeDetectionMode::Git => DetectionStrategy::Git,
            ChangeDetectionMode::Mtime => DetectionStrategy::Mtime,
            ChangeDetectionMode::Hash => DetectionStrategy::Hash,
            ChangeDetectionMode::Auto => {
                if is_git_work_tree(self.root) {
                    DetectionStrategy::Git
                } else {
                    DetectionStrategy::Mtime
                }
            }
        }
    }

    /// Every file in the tree is a candidate.
    fn full_scan(&self, strategy: DetectionStrategy) -> Result<ChangeSet> {
        let mut changes = ChangeSet::new(strategy);
        for file in walk_directory(self.root, self.walk)? {
            changes.insert_changed(file.relative_path, self.current_dir);
        }
        Ok(changes)
    }

    fn detect_mtime(&self) -> Result<ChangeSet> {
        let since = self
            .state
            .last_scan_started
            .map(SystemTime::from)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut changes = ChangeSet::new(DetectionStrategy::Mtime);
        for file in walk_directory(self.root, self.walk)? {
            let has_copy = self.current_dir.join(&file.relative_path).exists();
            if file.modified > since || !has_copy {
                changes.insert_changed(file.relative_path, self.current_dir);
            }
        }
        Ok(changes)
    }

    fn detect_hash(&self) -> Result<ChangeSet> {
        let previous: HashMap<&str, (u64, Option<&str>)> = self
            .previous
            .map(|m| {
                m.files
                    .iter()
                    .map(|f| (f.path.as_str(), (f.size, f.sha256.as_deref())))
                    .collect()
            })
            .unwrap_or_default();

        let mut changes = ChangeSet::new(DetectionStrategy::Hash);
        for file in walk_directory(self.root, self.walk)? {
            if file.is_symlink {
                changes.insert_changed(file.relative_path, self.current_dir);
                continue;
            }
            let key = file.relative_path.to_string_lossy().to_string();
            let changed = match previous.get(key.as_str()) {
                Some((size, Some(hash))) if *size == file.size => {
                    sha256_file(&file.path).map(|h| h != *hash).unwrap_or(true)
                }
                _ => true,
            };
            if changed {
                changes.insert_changed(file.relative_path, self.current_dir);
            }
        }
        Ok(changes)
    }

    fn detect_git(&self) -> Result<ChangeSet> {
        let prefix = git_output(self.root, &["rev-parse", "--show-prefix"])?;
        let prefix = String::from_utf8_lossy(&prefix).trim().to_string();

        let mut changes = ChangeSet::new(DetectionStrategy::Git);
        let head = git_head(self.root);

        let status = git_output(
            self.root,
            &["status", "--porcelain=v1", "-z", "--untracked-files=all", "--no-renames"],
        )?;
        let mut entries = parse_porcelain_status(&status);

        match (&self.state.git_head, &head) {
            (Some(previous), Some(current)) if previous != current => {
                match git_output(
                    self.root,
                    &["diff", "--name-status", "-z", "--no-renames", previous.as_str(), current.as_str()],
                ) {
                    Ok(diff) => entries.extend(parse_name_status(&diff)),
                    Err(e) => {
                        // Previous HEAD is gone (rebase, gc); every tracked file is a candidate
                        warn!("git diff against {} failed: {}", previous, e);
                        let tracked = git_output(self.root, &["ls-files", "-z"])?;
                        entries.extend(
                            split_nul(&tracked).map(|p| (GitChange::Modified, p.to_string())),
                        );
                    }
                }
            }
            _ => {}
        }

        for (kind, repo_path) in entries {
            let Some(relative) = strip_git_prefix(&repo_path, &prefix) else {
                continue;
            };
            match kind {
                GitChange::Deleted => {
                    if self.current_dir.join(&relative).exists() {
                        changes.added.remove(&relative);
                        changes.modified.remove(&relative);
                        changes.deleted.insert(relative);
                    }
                }
                GitChange::Added | GitChange::Modified => {
                    if self.root.join(&relative).symlink_metadata().is_ok() {
                        changes.insert_changed(relative, self.current_dir);
                    }
                }
            }
        }

        changes.git_head = head;
        Ok(changes)
    }

    /// Files recorded in the previous manifest whose source is gone.
    fn add_manifest_deletions(&self, changes: &mut ChangeSet) {
        let Some(previous) = self.previous else {
            return;
        };
        for entry in &previous.files {
            let relative = PathBuf::from(&entry.path);
            if self.root.join(&relative).symlink_metadata().is_err()
                && self.current_dir.join(&relative).exists()
            {
                changes.added.remove(&relative);
                changes.modified.remove(&relative);
                changes.deleted.insert(relative);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GitChange {
    Added,
    Modified,
    Deleted,
}

/// Whether `root` is inside a git work tree and git is installed.
pub fn is_git_work_tree(root: &Path) -> bool {
    if which::which("git").is_err() {
        return false;
    }
    git_output(root, &["rev-parse", "--is-inside-work-tree"])
        .map(|out| String::from_utf8_lossy(&out).trim() == "true")
        .unwrap_or(false)
}

/// Current HEAD commit, `None` outside a repository or before the first commit.
pub fn git_head(root: &Path) -> Option<String> {
    if which::which("git").is_err() {
        return None;
    }
    git_output(root, &["rev-parse", "--verify", "-q", "HEAD"])
        .ok()
        .map(|out| String::from_utf8_lossy(&out).trim().to_string())
        .filter(|s| !s.is_empty())
}

fn git_output(root: &Path, args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .map_err(|e| BackupError::ChangeDetection(format!("failed to run git: {}", e)))?;

    if !output.status.success() {
        return Err(BackupError::ChangeDetection(format!(
            "git {} exited with {}: {}",
            args.first().copied().unwrap_or_default(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

fn split_nul(bytes: &[u8]) -> impl Iterator<Item = &str> {
    bytes
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .filter_map(|s| std::str::from_utf8(s).ok())
}

/// Parse `git status --porcelain=v1 -z --no-renames` output.
pub(crate) fn parse_porcelain_status(output: &[u8]) -> Vec<(GitChange, String)> {
    split_nul(output)
        .filter(|entry| entry.len() > 3)
        .filter_map(|entry| {
            let (code, path) = entry.split_at(3);
            let mut chars = code.chars();
            let x = chars.next()?;
            let y = chars.next()?;
            let kind = match (x, y) {
                ('!', _) => return None,
                ('?', _) | ('A', _) => GitChange::Added,
                ('D', _) | (_, 'D') => GitChange::Deleted,
                _ => GitChange::Modified,
            };
            Some((kind, path.to_string()))
        })
        .collect()
}

/// Parse `git diff --name-status -z --no-renames` output.
pub(crate) fn parse_name_status(output: &[u8]) -> Vec<(GitChange, String)> {
    let fields: Vec<&str> = split_nul(output).collect();
    fields
        .chunks(2)
        .filter(|pair| pair.len() == 2)
        .map(|pair| {
            let kind = match pair[0].chars().next() {
                Some('A') => GitChange::Added,
                Some('D') => GitChange::Deleted,
                _ => GitChange::Modified,
            };
            (kind, pair[1].to_string())
        })
        .collect()
}

/// Convert a repository-relative path to a project-relative one. Paths
/// outside the project subdirectory yield `None`.
fn strip_git_prefix(repo_path: &str, prefix: &str) -> Option<PathBuf> {
    let relative = repo_path.strip_prefix(prefix)?;
    if relative.is_empty() {
        return None;
    }
    Some(PathBuf::from(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::manifest::FileEntry;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        project: TempDir,
        backup: TempDir,
        walk: WalkOptions,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                project: TempDir::new().unwrap(),
                backup: TempDir::new().unwrap(),
                walk: WalkOptions::default(),
            }
        }

        fn current(&self) -> PathBuf {
            self.backup.path().join("current")
        }

        fn detect(&self, mode: ChangeDetectionMode, state: &DetectorState, previous: Option<&Manifest>) -> ChangeSet {
            let current = self.current();
            ChangeDetector {
                root: self.project.path(),
                current_dir: &current,
                mode,
                walk: &self.walk,
                state,
                previous,
            }
            .detect()
            .unwrap()
        }

        fn snapshot(&self, relative: &str) {
            let target = self.current().join(relative);
            fs::create_dir_all(target.parent().unwrap()).unwrap();
            fs::copy(self.project.path().join(relative), target).unwrap();
        }
    }

    #[test]
    fn test_first_cycle_everything_added() {
        let fx = Fixture::new();
        fs::write(fx.project.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(fx.current()).unwrap();
        fs::write(fx.current().join(".DS_Store"), b"x").unwrap();

        let changes = fx.detect(ChangeDetectionMode::Mtime, &DetectorState::default(), None);
        assert!(changes.first_cycle);
        assert_eq!(changes.added.len(), 1);
        assert!(changes.added.contains(Path::new("a.txt")));
    }

    #[test]
    fn test_mtime_only_newer_files() {
        let fx = Fixture::new();
        fs::write(fx.project.path().join("old.txt"), b"old").unwrap();
        fs::write(fx.project.path().join("new.txt"), b"new").unwrap();
        fx.snapshot("old.txt");
        fx.snapshot("new.txt");

        let state = DetectorState {
            last_scan_started: Some(Utc::now() + chrono::Duration::seconds(5)),
            git_head: None,
        };
        let changes = fx.detect(ChangeDetectionMode::Mtime, &state, None);
        assert!(changes.is_empty());

        let state = DetectorState {
            last_scan_started: Some(Utc::now() - chrono::Duration::seconds(60)),
            git_head: None,
        };
        let changes = fx.detect(ChangeDetectionMode::Mtime, &state, None);
        assert_eq!(changes.modified.len(), 2);
    }

    #[test]
    fn test_mtime_picks_up_files_without_copy() {
        let fx = Fixture::new();
        fs::write(fx.project.path().join("a.txt"), b"a").unwrap();
        fs::write(fx.project.path().join("restored.txt"), b"r").unwrap();
        fx.snapshot("a.txt");

        let state = DetectorState {
            last_scan_started: Some(Utc::now() + chrono::Duration::seconds(5)),
            git_head: None,
        };
        let changes = fx.detect(ChangeDetectionMode::Mtime, &state, None);
        assert_eq!(changes.added.iter().collect::<Vec<_>>(), vec![Path::new("restored.txt")]);
        assert!(changes.modified.is_empty());
    }

    #[test]
    fn test_hash_mode_ignores_touched_files() {
        let fx = Fixture::new();
        let path = fx.project.path().join("a.txt");
        fs::write(&path, b"content").unwrap();
        fx.snapshot("a.txt");

        let manifest = Manifest::for_test(vec![FileEntry {
            path: "a.txt".into(),
            size: 7,
            modified: 0,
            critical: false,
            sha256: Some(sha256_file(&path).unwrap()),
        }]);
        let changes = fx.detect(ChangeDetectionMode::Hash, &DetectorState::default(), Some(&manifest));
        assert!(changes.is_empty());

        fs::write(&path, b"CONTENT").unwrap();
        let changes = fx.detect(ChangeDetectionMode::Hash, &DetectorState::default(), Some(&manifest));
        assert!(changes.modified.contains(Path::new("a.txt")));
    }

    #[test]
    fn test_deleted_from_previous_manifest() {
        let fx = Fixture::new();
        fs::write(fx.project.path().join("gone.txt"), b"x").unwrap();
        fx.snapshot("gone.txt");
        fs::remove_file(fx.project.path().join("gone.txt")).unwrap();
        fs::write(fx.project.path().join("keep.txt"), b"k").unwrap();
        fx.snapshot("keep.txt");

        let manifest = Manifest::for_test(vec![
            FileEntry { path: "gone.txt".into(), size: 1, modified: 0, critical: false, sha256: None },
            FileEntry { path: "keep.txt".into(), size: 1, modified: 0, critical: false, sha256: None },
        ]);
        let state = DetectorState {
            last_scan_started: Some(Utc::now() + chrono::Duration::seconds(5)),
            git_head: None,
        };
        let changes = fx.detect(ChangeDetectionMode::Mtime, &state, Some(&manifest));
        assert_eq!(changes.deleted.iter().collect::<Vec<_>>(), vec![Path::new("gone.txt")]);
        assert!(changes.added.is_empty() && changes.modified.is_empty());
    }

    #[test]
    fn test_forced_git_outside_repo_falls_back() {
        let fx = Fixture::new();
        fs::write(fx.project.path().join("a.txt"), b"a").unwrap();
        fx.snapshot("a.txt");

        let changes = fx.detect(ChangeDetectionMode::Git, &DetectorState::default(), None);
        assert_eq!(changes.strategy, DetectionStrategy::Full);
        assert!(changes.fallback_reason.is_some());
        assert!(changes.modified.contains(Path::new("a.txt")));
    }

    #[test]
    fn test_parse_porcelain_status() {
        let output = b" M src/lib.rs\0A  new.rs\0?? notes.txt\0D  old.rs\0 D gone.rs\0MM both.rs\0";
        let parsed = parse_porcelain_status(output);
        assert_eq!(
            parsed,
            vec![
                (GitChange::Modified, "src/lib.rs".to_string()),
                (GitChange::Added, "new.rs".to_string()),
                (GitChange::Added, "notes.txt".to_string()),
                (GitChange::Deleted, "old.rs".to_string()),
                (GitChange::Deleted, "gone.rs".to_string()),
                (GitChange::Modified, "both.rs".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_name_status() {
        let output = b"M\0src/a.rs\0A\0src/b.rs\0D\0src/c.rs\0";
        let parsed = parse_name_status(output);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[2], (GitChange::Deleted, "src/c.rs".to_string()));
    }

    #[test]
    fn test_strip_git_prefix() {
        assert_eq!(strip_git_prefix("web/src/a.ts", "web/"), Some(PathBuf::from("src/a.ts")));
        assert_eq!(strip_git_prefix("api/main.go", "web/"), None);
        assert_eq!(strip_git_prefix("a.txt", ""), Some(PathBuf::from("a.txt")));
    }
}
