//! Utility modules for the backup daemon.

pub mod atomic;
pub mod errors;
pub mod logger;
pub mod process;

pub use errors::{BackupError, Result};
