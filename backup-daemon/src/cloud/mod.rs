//! Cloud sync orchestrator.
//!
//! Works from the durable manifest of a finished cycle only. Selected
//! entries are compressed, optionally encrypted, and uploaded to the
//! configured remote. Entries whose content was already uploaded are
//! skipped; failed categories stay pending and are retried by the next
//! cycle. Upload failures never change a cycle's local outcome.

pub mod bundle;
pub mod crypto;
pub mod record;
pub mod remote;

use crate::config::CloudConfig;
use crate::database::engine::compress_file;
use crate::executor::manifest::Manifest;
use crate::executor::phase::Phase;
use crate::fs::metadata::sha256_file;
use crate::{BackupError, Result};
use chrono::Utc;
use crypto::{encrypt_file, CloudKey};
use record::{Category, CategoryResult, CloudUploadRecord};
use remote::Remote;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Called on every cloud sub-phase change.
pub type PhaseCallback = Arc<dyn Fn(Phase) + Send + Sync>;

/// Which categories are uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloudPolicy {
    pub databases: bool,
    pub critical: bool,
    pub all_files: bool,
}

impl CloudPolicy {
    pub fn from_config(config: &CloudConfig) -> Self {
        Self {
            databases: config.databases,
            critical: config.critical,
            all_files: config.all_files,
        }
    }

    pub fn categories(&self) -> Vec<Category> {
        let mut categories = Vec::new();
        if self.databases {
            categories.push(Category::Databases);
        }
        if self.critical {
            categories.push(Category::Critical);
        }
        if self.all_files {
            categories.push(Category::All);
        }
        categories
    }
}

/// One artifact to upload.
#[derive(Debug, Clone)]
struct Item {
    /// Local source (uncompressed for critical files)
    source: PathBuf,
    key: String,
    fingerprint: String,
    compress: bool,
}

#[derive(Clone)]
pub struct CloudSync {
    project: String,
    /// Project backup root (holds `current/`, `databases/`)
    backup_root: PathBuf,
    staging: PathBuf,
    record_path: PathBuf,
    remote: Remote,
    key: Option<Arc<CloudKey>>,
    policy: CloudPolicy,
    compression_level: i32,
    on_phase: Option<PhaseCallback>,
}

impl CloudSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: impl Into<String>,
        backup_root: impl Into<PathBuf>,
        staging: impl Into<PathBuf>,
        record_path: impl Into<PathBuf>,
        remote: Remote,
        key: Option<CloudKey>,
        policy: CloudPolicy,
        compression_level: i32,
    ) -> Self {
        Self {
            project: project.into(),
            backup_root: backup_root.into(),
            staging: staging.into(),
            record_path: record_path.into(),
            remote,
            key: key.map(Arc::new),
            policy,
            compression_level,
            on_phase: None,
        }
    }

    pub fn with_phase_callback(mut self, callback: PhaseCallback) -> Self {
        self.on_phase = Some(callback);
        self
    }

    fn phase(&self, phase: Phase) {
        debug!(project = %self.project, phase = %phase, "Cloud phase");
        if let Some(cb) = &self.on_phase {
            cb(phase);
        }
    }

    /// Upload from the manifest written at `manifest_path`. Reading it back
    /// from disk guarantees nothing is uploaded for a cycle whose manifest
    /// was not durably written.
    pub async fn sync(&self, manifest_path: &Path) -> Result<CloudUploadRecord> {
        let manifest = Manifest::load(manifest_path)?.ok_or_else(|| {
            BackupError::CloudUpload(format!("manifest {} not written", manifest_path.display()))
        })?;
        let mut record = CloudUploadRecord::load(&self.record_path, &self.project)?;
        self.phase(Phase::CloudSyncing);

        tokio::fs::create_dir_all(&self.staging).await?;
        let mut results = BTreeMap::new();
        for category in self.policy.categories() {
            let phase = match category {
                Category::Databases => Phase::CloudSyncingDatabases,
                Category::Critical => Phase::CloudSyncingFiles,
                Category::All => Phase::CloudSyncingArchives,
            };
            self.phase(phase);
            let result = match self.items(category, &manifest).await {
                Ok(items) => self.upload_category(category, items, &mut record).await,
                Err(e) => CategoryResult {
                    failed: 1,
                    error: Some(e.to_string()),
                    ..Default::default()
                },
            };
            if let Some(error) = &result.error {
                warn!(project = %self.project, category = %category, "Cloud upload failed: {}", error);
            }
            results.insert(category, result);
        }

        let success = record.finish_attempt(Utc::now(), results);
        record.save(&self.record_path)?;
        let _ = tokio::fs::remove_dir_all(&self.staging).await;

        let uploaded: usize = record.categories.values().map(|r| r.uploaded).sum();
        info!(
            project = %self.project,
            remote = %self.remote.describe(),
            uploaded,
            success,
            "Cloud sync finished"
        );
        Ok(record)
    }

    async fn items(&self, category: Category, manifest: &Manifest) -> Result<Vec<Item>> {
        let project = &self.project;
        let current = self.backup_root.join("current");
        match category {
            Category::Databases => {
                let mut items = Vec::new();
                for db in manifest.databases.iter().filter(|d| d.verified) {
                    let source = manifest.database_path(&self.backup_root, db);
                    let file_name = source
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| db.name.clone());
                    let hash_path = source.clone();
                    let fingerprint = tokio::task::spawn_blocking(move || sha256_file(&hash_path))
                        .await
                        .map_err(|e| BackupError::CloudUpload(format!("hash task failed: {e}")))??;
                    items.push(Item {
                        source,
                        key: format!("{project}/databases/{file_name}"),
                        fingerprint,
                        compress: false,
                    });
                }
                Ok(items)
            }
            Category::Critical => Ok(manifest
                .files
                .iter()
                .filter(|f| f.critical)
                .map(|f| Item {
                    source: current.join(&f.path),
                    key: format!("{project}/critical/{}.zst", f.path),
                    fingerprint: f
                        .sha256
                        .clone()
                        .unwrap_or_else(|| format!("{}:{}", f.size, f.modified)),
                    compress: true,
                })
                .collect()),
            Category::All => {
                let mut hasher = Sha256::new();
                for f in &manifest.files {
                    hasher.update(f.path.as_bytes());
                    hasher.update(f.size.to_le_bytes());
                    hasher.update(f.modified.to_le_bytes());
                }
                Ok(vec![Item {
                    source: current,
                    key: format!("{project}/archives/current.tar.zst"),
                    fingerprint: hex::encode(hasher.finalize()),
                    compress: false,
                }])
            }
        }
    }

    async fn upload_category(
        &self,
        category: Category,
        items: Vec<Item>,
        record: &mut CloudUploadRecord,
    ) -> CategoryResult {
        let mut result = CategoryResult::default();
        let pending: Vec<Item> = items
            .into_iter()
            .filter(|item| {
                let key = self.remote_key(&item.key);
                if record.is_current(&key, &item.fingerprint) {
                    result.skipped += 1;
                    false
                } else {
                    true
                }
            })
            .collect();
        if pending.is_empty() {
            return result;
        }

        let prepared = match category {
            Category::All => match self.prepare_bundle(&pending[0]).await {
                Ok(artifact) => vec![Ok((pending[0].clone(), artifact))],
                Err(e) => vec![Err((pending[0].clone(), e))],
            },
            _ => self.prepare_items(pending).await,
        };

        let needs_encryption = self.key.is_some() && !prepared.is_empty();
        if needs_encryption {
            self.phase(Phase::CloudSyncingEncrypting);
        }

        for prepared_item in prepared {
            let (item, artifact) = match prepared_item {
                Ok(pair) => pair,
                Err((item, e)) => {
                    result.failed += 1;
                    result.error = Some(format!("{}: {}", item.key, e));
                    continue;
                }
            };
            let key = self.remote_key(&item.key);
            let upload = match self.encrypt(&artifact).await {
                Ok(sealed) => self.remote.upload(&sealed, &key, None).await,
                Err(e) => Err(e),
            };
            match upload {
                Ok(bytes) => {
                    result.uploaded += 1;
                    result.bytes += bytes;
                    record.uploaded.insert(key, item.fingerprint.clone());
                }
                Err(e) => {
                    result.failed += 1;
                    result.error = Some(format!("{key}: {e}"));
                }
            }
        }
        result
    }

    /// Remote key with the encryption suffix applied.
    fn remote_key(&self, key: &str) -> String {
        if self.key.is_some() {
            format!("{key}.enc")
        } else {
            key.to_string()
        }
    }

    /// Compress items on blocking tasks, bounded by available cores.
    async fn prepare_items(&self, items: Vec<Item>) -> Vec<std::result::Result<(Item, PathBuf), (Item, BackupError)>> {
        let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut handles = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let staging = self.staging.clone();
            let level = self.compression_level;
            handles.push(tokio::spawn(async move {
                if !item.compress {
                    return Ok((item.clone(), item.source.clone()));
                }
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return Err((item, BackupError::CloudUpload(format!("semaphore closed: {e}")))),
                };
                let source = item.source.clone();
                let target = staging.join(format!("{index:06}.zst"));
                let staged = target.clone();
                let compressed = tokio::task::spawn_blocking(move || compress_file(&source, &staged, level)).await;
                match compressed {
                    Ok(Ok(_)) => Ok((item, target)),
                    Ok(Err(e)) => Err((item, BackupError::Io(e))),
                    Err(e) => Err((item, BackupError::CloudUpload(format!("compression task failed: {e}")))),
                }
            }));
        }

        let mut prepared = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => prepared.push(outcome),
                Err(e) => warn!("Cloud compression task panicked: {}", e),
            }
        }
        prepared
    }

    async fn prepare_bundle(&self, item: &Item) -> Result<PathBuf> {
        let root = item.source.clone();
        let target = self.staging.join("current.tar.zst");
        let staged = target.clone();
        let level = self.compression_level;
        tokio::task::spawn_blocking(move || bundle::bundle_tree(&root, &staged, level))
            .await
            .map_err(|e| BackupError::CloudUpload(format!("bundle task failed: {e}")))??;
        Ok(target)
    }

    async fn encrypt(&self, artifact: &Path) -> Result<PathBuf> {
        let Some(key) = &self.key else {
            return Ok(artifact.to_path_buf());
        };
        let key = Arc::clone(key);
        let source = artifact.to_path_buf();
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        let target = self.staging.join(format!("{name}.{}.enc", uuid::Uuid::new_v4()));
        let sealed = target.clone();
        tokio::task::spawn_blocking(move || encrypt_file(&key, &source, &sealed))
            .await
            .map_err(|e| BackupError::Encryption(format!("encryption task failed: {e}")))??;
        Ok(target)
    }
}

/// Background uploads, at most one per project.
#[derive(Clone, Default)]
pub struct CloudTasks {
    tasks: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
}

impl CloudTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `upload` for `project` unless its previous upload is still
    /// running. Returns whether it was started.
    pub async fn spawn<F>(&self, project: &str, upload: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.write().await;
        if let Some(existing) = tasks.get(project) {
            if !existing.is_finished() {
                info!(project = %project, "Previous cloud upload still running, deferring");
                return false;
            }
        }
        tasks.insert(project.to_string(), tokio::spawn(upload));
        true
    }

    pub async fn is_running(&self, project: &str) -> bool {
        let tasks = self.tasks.read().await;
        tasks.get(project).map(|h| !h.is_finished()).unwrap_or(false)
    }

    pub async fn running_count(&self) -> usize {
        let tasks = self.tasks.read().await;
        tasks.values().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every running upload.
    pub async fn join_all(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = self.tasks.write().await;
            tasks.drain().collect()
        };
        for (project, handle) in handles {
            if let Err(e) = handle.await {
                warn!(project = %project, "Cloud upload task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::manifest::{DatabaseEntry, FileEntry};
    use crate::database::engine::Engine;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        backup: TempDir,
        remote: TempDir,
        state: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let fx = Self {
                backup: TempDir::new().unwrap(),
                remote: TempDir::new().unwrap(),
                state: TempDir::new().unwrap(),
            };
            let current = fx.backup.path().join("current");
            fs::create_dir_all(current.join("src")).unwrap();
            fs::write(current.join(".env"), b"SECRET=1").unwrap();
            fs::write(current.join("src/main.rs"), b"fn main() {}").unwrap();
            fs::create_dir_all(fx.backup.path().join("databases")).unwrap();
            fs::write(fx.backup.path().join("databases/app.20260101_000000_1.sqlite.zst"), b"dump").unwrap();
            fx
        }

        fn manifest_path(&self) -> PathBuf {
            let mut manifest = Manifest::for_test(vec![
                FileEntry {
                    path: ".env".into(),
                    size: 8,
                    modified: 1,
                    critical: true,
                    sha256: None,
                },
                FileEntry {
                    path: "src/main.rs".into(),
                    size: 12,
                    modified: 1,
                    critical: false,
                    sha256: None,
                },
            ]);
            manifest.databases.push(DatabaseEntry {
                name: "app.db".into(),
                engine: Engine::Sqlite,
                path: "databases/app.20260101_000000_1.sqlite.zst".into(),
                size: 4,
                tables: Some(1),
                verified: true,
            });
            let path = self.backup.path().join("manifest.json");
            manifest.write(&path).unwrap();
            path
        }

        fn sync(&self, policy: CloudPolicy, key: Option<CloudKey>) -> CloudSync {
            CloudSync::new(
                "app",
                self.backup.path(),
                self.state.path().join("staging"),
                self.state.path().join("cloud/app.json"),
                Remote::Directory {
                    root: self.remote.path().to_path_buf(),
                },
                key,
                policy,
                3,
            )
        }
    }

    const ALL: CloudPolicy = CloudPolicy {
        databases: true,
        critical: true,
        all_files: true,
    };

    #[tokio::test]
    async fn test_uploads_selected_categories() -> Result<()> {
        let fx = Fixture::new();
        let phases = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&phases);
        let sync = fx
            .sync(ALL, None)
            .with_phase_callback(Arc::new(move |p| seen.lock().unwrap().push(p)));

        let record = sync.sync(&fx.manifest_path()).await?;
        assert!(record.last_success.is_some());
        assert_eq!(record.categories[&Category::Databases].uploaded, 1);
        assert_eq!(record.categories[&Category::Critical].uploaded, 1);
        assert_eq!(record.categories[&Category::All].uploaded, 1);

        let remote = fx.remote.path().join("app");
        assert_eq!(fs::read(remote.join("databases/app.20260101_000000_1.sqlite.zst"))?, b"dump");
        let env = zstd::decode_all(&fs::read(remote.join("critical/.env.zst"))?[..])?;
        assert_eq!(env, b"SECRET=1");
        assert!(remote.join("archives/current.tar.zst").exists());

        let phases = phases.lock().unwrap().clone();
        assert_eq!(phases[0], Phase::CloudSyncing);
        assert!(phases.contains(&Phase::CloudSyncingArchives));
        assert!(!phases.contains(&Phase::CloudSyncingEncrypting));
        Ok(())
    }

    #[tokio::test]
    async fn test_unchanged_entries_skipped() -> Result<()> {
        let fx = Fixture::new();
        let manifest = fx.manifest_path();
        let policy = CloudPolicy {
            all_files: false,
            ..ALL
        };
        fx.sync(policy, None).sync(&manifest).await?;
        let second = fx.sync(policy, None).sync(&manifest).await?;
        assert_eq!(second.categories[&Category::Databases].uploaded, 0);
        assert_eq!(second.categories[&Category::Databases].skipped, 1);
        assert_eq!(second.categories[&Category::Critical].skipped, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_encrypted_uploads_are_ciphertext() -> Result<()> {
        let fx = Fixture::new();
        let key = CloudKey::generate();
        let policy = CloudPolicy {
            databases: false,
            critical: true,
            all_files: false,
        };
        fx.sync(policy, Some(key.clone())).sync(&fx.manifest_path()).await?;

        let sealed = fx.remote.path().join("app/critical/.env.zst.enc");
        let bytes = fs::read(&sealed)?;
        assert_eq!(&bytes[..8], crypto::MAGIC);
        assert!(!bytes.windows(6).any(|w| w == b"SECRET"));

        let out = fx.state.path().join("opened.zst");
        crypto::decrypt_file(&key, &sealed, &out)?;
        assert_eq!(zstd::decode_all(&fs::read(out)?[..])?, b"SECRET=1");
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_retried() -> Result<()> {
        let fx = Fixture::new();
        let manifest = fx.manifest_path();
        let blocker = fx.state.path().join("blocker");
        fs::write(&blocker, b"")?;
        let policy = CloudPolicy {
            databases: true,
            critical: false,
            all_files: false,
        };

        let mut failing = fx.sync(policy, None);
        failing.remote = Remote::Directory { root: blocker };
        let record = failing.sync(&manifest).await?;
        assert!(record.last_success.is_none());
        assert_eq!(record.consecutive_failures, 1);
        assert!(record.pending.contains(&Category::Databases));

        let record = fx.sync(policy, None).sync(&manifest).await?;
        assert_eq!(record.categories[&Category::Databases].uploaded, 1);
        assert!(record.pending.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_manifest_uploads_nothing() {
        let fx = Fixture::new();
        let err = fx
            .sync(ALL, None)
            .sync(&fx.backup.path().join("manifest.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::CloudUpload(_)));
        assert_eq!(fs::read_dir(fx.remote.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cloud_tasks_defer_running_project() {
        let tasks = CloudTasks::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        assert!(tasks.spawn("app", async move { let _ = rx.await; }).await);
        assert!(tasks.is_running("app").await);
        assert!(!tasks.spawn("app", async {}).await);
        assert!(tasks.spawn("other", async {}).await);

        let _ = tx.send(());
        tasks.join_all().await;
        assert_eq!(tasks.running_count().await, 0);
    }
}
