//! Upload targets.

use crate::config::{RemoteConfig, RemoteKind};
use crate::transfer::progress_stream::{ProgressCallback, ProgressStream};
use crate::{BackupError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Where artifacts go. Keys are '/'-separated paths below the target.
#[derive(Debug, Clone)]
pub enum Remote {
    /// `rclone copyto <file> <target>/<key>`
    Rclone { target: String },
    /// `POST <base>/<key>` with the artifact as a streamed body
    Http {
        base: String,
        token: Option<String>,
        client: reqwest::Client,
    },
    /// Local or mounted directory
    Directory { root: PathBuf },
}

impl Remote {
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let target = config.target.trim();
        if target.is_empty() {
            return Err(BackupError::ConfigInvalid("cloud remote target is empty".into()));
        }
        Ok(match config.kind {
            RemoteKind::Rclone => Remote::Rclone {
                target: target.trim_end_matches('/').to_string(),
            },
            RemoteKind::Http => {
                reqwest::Url::parse(target)
                    .map_err(|e| BackupError::ConfigInvalid(format!("cloud remote URL: {e}")))?;
                Remote::Http {
                    base: target.trim_end_matches('/').to_string(),
                    token: config.token.clone(),
                    client: reqwest::Client::new(),
                }
            }
            RemoteKind::Directory => Remote::Directory {
                root: PathBuf::from(target),
            },
        })
    }

    pub fn describe(&self) -> String {
        match self {
            Remote::Rclone { target } => format!("rclone:{target}"),
            Remote::Http { base, .. } => base.clone(),
            Remote::Directory { root } => root.display().to_string(),
        }
    }

    /// Upload `local` under `key`. Returns the bytes sent.
    pub async fn upload(&self, local: &Path, key: &str, progress: Option<ProgressCallback>) -> Result<u64> {
        let size = tokio::fs::metadata(local).await?.len();
        match self {
            Remote::Rclone { target } => {
                let destination = format!("{target}/{key}");
                let output = Command::new("rclone")
                    .arg("copyto")
                    .arg(local)
                    .arg(&destination)
                    .stdin(Stdio::null())
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|e| {
                        if e.kind() == std::io::ErrorKind::NotFound {
                            BackupError::DependencyMissing { tool: "rclone".into() }
                        } else {
                            BackupError::CloudUpload(format!("rclone: {e}"))
                        }
                    })?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(BackupError::CloudUpload(format!(
                        "rclone copyto {} exited with {}: {}",
                        destination,
                        output.status,
                        stderr.trim()
                    )));
                }
                if let Some(cb) = progress {
                    cb(size);
                }
            }
            Remote::Http { base, token, client } => {
                let url = format!("{base}/{key}");
                let file = tokio::fs::File::open(local).await?;
                let counter = Arc::new(AtomicU64::new(0));
                let mut stream = ProgressStream::new(ReaderStream::new(file), counter);
                if let Some(cb) = progress {
                    stream = stream.with_callback(cb);
                }

                let mut request = client
                    .post(&url)
                    .header("x-relative-path", key)
                    .header("x-total-size", size.to_string())
                    .header(reqwest::header::CONTENT_LENGTH, size.to_string())
                    .body(reqwest::Body::wrap_stream(stream));
                if let Some(token) = token {
                    request = request.bearer_auth(token);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| BackupError::CloudUpload(format!("{url}: {e}")))?;
                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(BackupError::CloudUpload(format!(
                        "{url} returned {status}: {}",
                        body.trim()
                    )));
                }
            }
            Remote::Directory { root } => {
                let destination = root.join(key);
                let parent = destination
                    .parent()
                    .ok_or_else(|| BackupError::CloudUpload(format!("invalid key {key}")))?
                    .to_path_buf();
                tokio::fs::create_dir_all(&parent).await.map_err(|e| {
                    BackupError::CloudUpload(format!("{}: {}", parent.display(), e))
                })?;
                let staged = parent.join(format!(".upload-{}", uuid::Uuid::new_v4()));
                let copied = async {
                    tokio::fs::copy(local, &staged).await?;
                    tokio::fs::rename(&staged, &destination).await
                }
                .await;
                if let Err(e) = copied {
                    let _ = tokio::fs::remove_file(&staged).await;
                    return Err(BackupError::CloudUpload(format!("{}: {}", destination.display(), e)));
                }
                if let Some(cb) = progress {
                    cb(size);
                }
            }
        }
        debug!("Uploaded {} to {} as {}", local.display(), self.describe(), key);
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_directory_remote_upload() -> Result<()> {
        let remote_dir = TempDir::new()?;
        let src = TempDir::new()?;
        let file = src.path().join("dump.sql.zst");
        fs::write(&file, b"payload")?;

        let remote = Remote::from_config(&RemoteConfig {
            kind: RemoteKind::Directory,
            target: remote_dir.path().display().to_string(),
            token: None,
        })?;

        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = Arc::clone(&seen);
        let sent = remote
            .upload(
                &file,
                "app/databases/dump.sql.zst",
                Some(Arc::new(move |n| seen_cb.store(n, Ordering::Relaxed))),
            )
            .await?;
        assert_eq!(sent, 7);
        assert_eq!(seen.load(Ordering::Relaxed), 7);
        assert_eq!(fs::read(remote_dir.path().join("app/databases/dump.sql.zst"))?, b"payload");
        Ok(())
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_upload_failure() -> Result<()> {
        let src = TempDir::new()?;
        let file = src.path().join("a");
        fs::write(&file, b"x")?;
        // A regular file where the remote root directory should be
        let blocker = src.path().join("not-a-dir");
        fs::write(&blocker, b"")?;

        let remote = Remote::Directory { root: blocker };
        let err = remote.upload(&file, "app/a", None).await.unwrap_err();
        assert!(matches!(err, BackupError::CloudUpload(_)));
        Ok(())
    }

    #[test]
    fn test_http_remote_requires_url() {
        let config = RemoteConfig {
            kind: RemoteKind::Http,
            target: "not a url".into(),
            token: None,
        };
        assert!(matches!(Remote::from_config(&config), Err(BackupError::ConfigInvalid(_))));
    }
}
