//! File metadata and content comparison helpers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::time::SystemTime;

const COMPARE_BUF: usize = 64 * 1024;

/// File metadata preserved alongside snapshot copies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time (seconds since Unix epoch)
    pub modified: u64,

    /// File permissions (Unix mode bits)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,

    /// Is this a symlink?
    pub is_symlink: bool,
}

impl FileMetadata {
    /// Extract metadata without following symlinks
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;

        let modified = metadata
            .modified()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(Self {
            size: metadata.len(),
            modified,
            permissions,
            is_symlink: metadata.file_type().is_symlink(),
        })
    }

    /// Apply the permission bits to another file
    #[cfg(unix)]
    pub fn apply_to_path(&self, path: &Path) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(mode) = self.permissions {
            fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn apply_to_path(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// Byte-for-byte comparison. Different sizes short-circuit.
pub fn files_identical(a: &Path, b: &Path) -> io::Result<bool> {
    let (meta_a, meta_b) = (fs::metadata(a)?, fs::metadata(b)?);
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    let mut file_a = File::open(a)?;
    let mut file_b = File::open(b)?;
    let mut buf_a = vec![0u8; COMPARE_BUF];
    let mut buf_b = vec![0u8; COMPARE_BUF];

    loop {
        let n = read_full(&mut file_a, &mut buf_a)?;
        let m = read_full(&mut file_b, &mut buf_b)?;
        if n != m || buf_a[..n] != buf_b[..m] {
            return Ok(false);
        }
        if n == 0 {
            return Ok(true);
        }
    }
}

/// Hex-encoded sha256 of a file's content
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COMPARE_BUF];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
