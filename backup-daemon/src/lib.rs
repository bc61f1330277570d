//! Continuous, versioned backups of project directories.
//!
//! Each registered project is backed up in cycles: detect changes, archive
//! replaced versions, copy, verify, snapshot embedded databases, write a
//! manifest and optionally push to a cloud remote. A daemon schedules the
//! cycles; a separate watchdog process checks that the daemon is alive.

pub mod api;
pub mod cloud;
pub mod config;
pub mod daemon;
pub mod database;
pub mod executor;
pub mod fs;
pub mod registry;
pub mod status;
pub mod transfer;
pub mod utils;
pub mod ws;

pub use utils::errors::{BackupError, Result};
