//! External tool discovery and progressive installation.
//!
//! Tools are only required once a project actually needs them. Missing
//! tools are collected into one install plan so the operator approves a
//! single prompt rather than one per package.

use crate::config::{Config, RemoteKind};
use crate::database::engine::Engine;
use crate::{BackupError, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::process::Command;
use tracing::{info, warn};

/// Tools needed to dump the given engines.
pub fn required_tools<I: IntoIterator<Item = Engine>>(engines: I) -> BTreeSet<&'static str> {
    engines.into_iter().filter_map(|e| e.dump_tool()).collect()
}

/// Tools required by the cloud remote, if cloud sync is on.
pub fn cloud_tools(config: &Config) -> BTreeSet<&'static str> {
    let mut tools = BTreeSet::new();
    if config.cloud.enabled && config.cloud.remote.kind == RemoteKind::Rclone {
        tools.insert("rclone");
    }
    tools
}

/// The subset of `tools` not found on `PATH`.
pub fn missing_tools(tools: &BTreeSet<&'static str>) -> Vec<&'static str> {
    tools
        .iter()
        .copied()
        .filter(|tool| which::which(tool).is_err())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Brew,
    Apt,
    Dnf,
    Pacman,
}

impl PackageManager {
    pub fn program(&self) -> &'static str {
        match self {
            PackageManager::Brew => "brew",
            PackageManager::Apt => "apt-get",
            PackageManager::Dnf => "dnf",
            PackageManager::Pacman => "pacman",
        }
    }

    /// First package manager present on this machine.
    pub fn detect() -> Option<Self> {
        [
            PackageManager::Brew,
            PackageManager::Apt,
            PackageManager::Dnf,
            PackageManager::Pacman,
        ]
        .into_iter()
        .find(|pm| which::which(pm.program()).is_ok())
    }

    /// Package providing `tool`.
    pub fn package_for(&self, tool: &str) -> Option<&'static str> {
        let package = match (self, tool) {
            (PackageManager::Brew, "pg_dump" | "pg_dumpall") => "libpq",
            (PackageManager::Brew, "mysqldump") => "mysql-client",
            (PackageManager::Brew, "mongodump") => "mongodb-database-tools",
            (PackageManager::Apt, "pg_dump" | "pg_dumpall") => "postgresql-client",
            (PackageManager::Apt, "mysqldump") => "default-mysql-client",
            (PackageManager::Apt, "mongodump") => "mongodb-database-tools",
            (PackageManager::Dnf, "pg_dump" | "pg_dumpall") => "postgresql",
            (PackageManager::Dnf, "mysqldump") => "mysql",
            (PackageManager::Dnf, "mongodump") => "mongodb-database-tools",
            (PackageManager::Pacman, "pg_dump" | "pg_dumpall") => "postgresql-libs",
            (PackageManager::Pacman, "mysqldump") => "mariadb-clients",
            (PackageManager::Pacman, "mongodump") => return None,
            (_, "rclone") => "rclone",
            (_, "git") => "git",
            _ => return None,
        };
        Some(package)
    }

    fn install_args(&self, packages: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = match self {
            PackageManager::Brew => vec!["install".into()],
            PackageManager::Apt | PackageManager::Dnf => vec!["install".into(), "-y".into()],
            PackageManager::Pacman => vec!["-S".into(), "--noconfirm".into()],
        };
        args.extend(packages.iter().map(|p| p.to_string()));
        args
    }
}

/// Packages to install for a set of missing tools.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub manager: Option<PackageManager>,
    pub packages: Vec<&'static str>,
    /// Tools no known package provides here
    pub unresolved: Vec<&'static str>,
}

impl InstallPlan {
    pub fn for_platform(missing: &[&'static str]) -> Self {
        Self::with_manager(PackageManager::detect(), missing)
    }

    pub fn with_manager(manager: Option<PackageManager>, missing: &[&'static str]) -> Self {
        let mut packages: Vec<&'static str> = Vec::new();
        let mut unresolved = Vec::new();
        for tool in missing {
            match manager.and_then(|m| m.package_for(tool)) {
                Some(package) => {
                    if !packages.contains(&package) {
                        packages.push(package);
                    }
                }
                None => unresolved.push(*tool),
            }
        }
        Self {
            manager,
            packages,
            unresolved,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.unresolved.is_empty()
    }

    /// Command line that would install the packages.
    pub fn command_line(&self) -> Option<String> {
        let manager = self.manager?;
        if self.packages.is_empty() {
            return None;
        }
        let mut parts = Vec::new();
        if manager != PackageManager::Brew {
            parts.push("sudo".to_string());
        }
        parts.push(manager.program().to_string());
        parts.extend(manager.install_args(&self.packages));
        Some(parts.join(" "))
    }

    /// Install everything after one approval. `approve` is called once with
    /// the plan and returns whether to proceed.
    pub fn execute<F>(&self, approve: F) -> Result<bool>
    where
        F: FnOnce(&InstallPlan) -> bool,
    {
        let Some(manager) = self.manager else {
            if let Some(tool) = self.unresolved.first() {
                return Err(BackupError::DependencyMissing {
                    tool: tool.to_string(),
                });
            }
            return Ok(false);
        };
        if self.packages.is_empty() {
            return Ok(false);
        }
        if !approve(self) {
            info!("Dependency install declined");
            return Ok(false);
        }

        let mut cmd = if manager == PackageManager::Brew {
            Command::new(manager.program())
        } else {
            let mut c = Command::new("sudo");
            c.arg(manager.program());
            c
        };
        cmd.args(manager.install_args(&self.packages));

        info!("Installing {}", self.packages.join(", "));
        let status = cmd.status()?;
        if !status.success() {
            warn!("{} exited with {}", manager.program(), status);
            return Err(BackupError::DependencyMissing {
                tool: self.packages.join(", "),
            });
        }
        Ok(true)
    }
}

impl fmt::Display for InstallPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command_line() {
            Some(cmd) => write!(f, "{cmd}")?,
            None => write!(f, "nothing to install")?,
        }
        if !self.unresolved.is_empty() {
            write!(f, " (install manually: {})", self.unresolved.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_tools() {
        let tools = required_tools([Engine::Sqlite, Engine::Postgres, Engine::Postgres, Engine::Mongodb]);
        assert_eq!(tools.into_iter().collect::<Vec<_>>(), vec!["mongodump", "pg_dump"]);
    }

    #[test]
    fn test_plan_merges_packages() {
        let plan = InstallPlan::with_manager(Some(PackageManager::Apt), &["pg_dump", "pg_dumpall", "rclone"]);
        assert_eq!(plan.packages, vec!["postgresql-client", "rclone"]);
        assert!(plan.unresolved.is_empty());
        assert_eq!(
            plan.command_line().as_deref(),
            Some("sudo apt-get install -y postgresql-client rclone")
        );
    }

    #[test]
    fn test_plan_without_package_manager() {
        let plan = InstallPlan::with_manager(None, &["mysqldump"]);
        assert!(plan.packages.is_empty());
        assert_eq!(plan.unresolved, vec!["mysqldump"]);
        assert!(matches!(
            plan.execute(|_| true),
            Err(BackupError::DependencyMissing { .. })
        ));
    }

    #[test]
    fn test_declined_plan_installs_nothing() -> Result<()> {
        let plan = InstallPlan::with_manager(Some(PackageManager::Brew), &["mongodump"]);
        let mut asked = 0;
        let installed = plan.execute(|p| {
            asked += 1;
            assert_eq!(p.packages, vec!["mongodb-database-tools"]);
            false
        })?;
        assert!(!installed);
        assert_eq!(asked, 1);
        Ok(())
    }

    #[test]
    fn test_missing_tools_filters_present() {
        let tools: BTreeSet<&'static str> = ["sh", "definitely-not-a-real-tool-xyz"].into_iter().collect();
        assert_eq!(missing_tools(&tools), vec!["definitely-not-a-real-tool-xyz"]);
    }
}
