//! Critical-file inclusion policy.
//!
//! Environment files, credentials, IDE settings and local overrides are
//! usually ignored by version control, which is exactly why losing them
//! hurts. They are always part of the snapshot set regardless of the change
//! detection strategy.

use crate::fs::walker::{walk_directory, FileInfo, WalkOptions};
use crate::{BackupError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Patterns matched against paths relative to the project root.
pub const CRITICAL_PATTERNS: &[&str] = &[
    // Environment files
    "**/.env",
    "**/.env.*",
    "**/*.env",
    "**/.envrc",
    // Credentials and keys
    "**/credentials",
    "**/credentials.json",
    "**/*credentials*.json",
    "**/secrets.{json,yml,yaml,toml}",
    "**/*.pem",
    "**/*.key",
    "**/*.p12",
    "**/.npmrc",
    "**/.pypirc",
    "**/.netrc",
    "**/service-account*.json",
    // IDE settings
    "**/.vscode/settings.json",
    "**/.vscode/launch.json",
    "**/.vscode/tasks.json",
    "**/.idea/workspace.xml",
    "**/.idea/runConfigurations/*.xml",
    // Local overrides
    "**/*.local",
    "**/*.local.*",
    "**/docker-compose.override.yml",
    "**/*.override.*",
];

/// Compiled critical-file matcher
#[derive(Debug, Clone)]
pub struct CriticalFiles {
    set: GlobSet,
}

impl CriticalFiles {
    /// Built-in patterns plus user-configured ones.
    pub fn new(extra_patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let patterns = CRITICAL_PATTERNS
            .iter()
            .map(|s| s.to_string())
            .chain(extra_patterns.iter().cloned());

        for pattern in patterns {
            let glob = Glob::new(&pattern).map_err(|e| {
                BackupError::ConfigInvalid(format!("invalid critical pattern '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }

        let set = builder
            .build()
            .map_err(|e| BackupError::ConfigInvalid(format!("critical patterns: {}", e)))?;
        Ok(Self { set })
    }

    pub fn is_critical(&self, relative_path: &Path) -> bool {
        self.set.is_match(relative_path)
    }

    /// Every critical file under `root`, ignoring version-control ignore rules
    /// but still pruning regenerable directories.
    pub fn find(&self, root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
        Ok(walk_directory(root, options)?
            .into_iter()
            .filter(|f| !f.is_symlink && self.is_critical(&f.relative_path))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_patterns() -> Result<()> {
        let critical = CriticalFiles::new(&[])?;
        for path in [
            ".env",
            "api/.env.production",
            "config/master.key",
            ".vscode/settings.json",
            "settings.local.json",
            ".claude/settings.local.json",
            "docker-compose.override.yml",
            "gcp/credentials.json",
            "certs/server.pem",
        ] {
            assert!(critical.is_critical(Path::new(path)), "{path} should be critical");
        }
        for path in ["src/main.rs", "README.md", ".vscode/extensions.json", "environment.ts"] {
            assert!(!critical.is_critical(Path::new(path)), "{path} should not be critical");
        }
        Ok(())
    }

    #[test]
    fn test_extra_patterns() -> Result<()> {
        let critical = CriticalFiles::new(&["**/*.sqlite-wal".to_string()])?;
        assert!(critical.is_critical(Path::new("data/app.sqlite-wal")));
        assert!(CriticalFiles::new(&["[".to_string()]).is_err());
        Ok(())
    }

    #[test]
    fn test_find_skips_regenerable_dirs() -> Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("node_modules/pkg"))?;
        fs::create_dir_all(dir.path().join(".vscode"))?;
        fs::write(dir.path().join(".env"), b"SECRET=1")?;
        fs::write(dir.path().join(".vscode/settings.json"), b"{}")?;
        fs::write(dir.path().join("node_modules/pkg/.env"), b"X=1")?;
        fs::write(dir.path().join("main.py"), b"print()")?;

        let critical = CriticalFiles::new(&[])?;
        let mut found: Vec<PathBuf> = critical
            .find(dir.path(), &WalkOptions::default())?
            .into_iter()
            .map(|f| f.relative_path)
            .collect();
        found.sort();
        assert_eq!(found, vec![PathBuf::from(".env"), PathBuf::from(".vscode/settings.json")]);
        Ok(())
    }
}
