//! Per-project record of cloud uploads.

use crate::utils::atomic::{read_json, write_json_atomic};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Databases,
    Critical,
    All,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Databases => "databases",
            Category::Critical => "critical",
            Category::All => "all",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryResult {
    pub uploaded: usize,
    /// Entries already uploaded with the same content
    pub skipped: usize,
    pub failed: usize,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CategoryResult {
    pub fn succeeded(&self) -> bool {
        self.failed == 0 && self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudUploadRecord {
    pub project: String,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Results of the latest attempt
    pub categories: BTreeMap<Category, CategoryResult>,
    pub consecutive_failures: u32,
    /// Categories that failed and are retried next cycle
    pub pending: BTreeSet<Category>,
    /// Remote key -> content fingerprint of the last successful upload
    pub uploaded: BTreeMap<String, String>,
}

impl CloudUploadRecord {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Default::default()
        }
    }

    pub fn load(path: &Path, project: &str) -> Result<Self> {
        Ok(read_json(path)?.unwrap_or_else(|| Self::new(project)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Whether `key` was already uploaded with this content.
    pub fn is_current(&self, key: &str, fingerprint: &str) -> bool {
        self.uploaded.get(key).map(|f| f == fingerprint).unwrap_or(false)
    }

    /// Fold one attempt's category results into the record.
    pub fn finish_attempt(&mut self, at: DateTime<Utc>, results: BTreeMap<Category, CategoryResult>) -> bool {
        self.last_attempt = Some(at);
        let success = results.values().all(CategoryResult::succeeded);
        for (category, result) in &results {
            if result.succeeded() {
                self.pending.remove(category);
            } else {
                self.pending.insert(*category);
            }
        }
        self.categories = results;
        if success {
            self.last_success = Some(at);
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        success
    }
}
