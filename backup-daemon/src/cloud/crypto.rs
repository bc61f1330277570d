//! Client-side encryption of upload artifacts.
//!
//! AES-256-GCM over 1 MiB chunks. Layout:
//!
//! ```text
//! BKUPENC1 | (chunk_len u32 BE | nonce [12] | ciphertext) *
//! ```
//!
//! Each chunk is authenticated with its index and a last-chunk flag as
//! associated data, so reordered, dropped or truncated chunks fail to
//! decrypt.

use crate::{BackupError, Result};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const MAGIC: &[u8; 8] = b"BKUPENC1";
pub const CHUNK_SIZE: usize = 1024 * 1024;
const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
/// GCM tag appended to every chunk
const TAG_SIZE: usize = 16;

/// Upload key, zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CloudKey {
    bytes: [u8; KEY_SIZE],
}

impl CloudKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(BackupError::Encryption(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Read a hex-encoded key file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            BackupError::Encryption(format!("cannot read key {}: {}", path.display(), e))
        })?;
        let mut raw = hex::decode(text.trim())
            .map_err(|e| BackupError::Encryption(format!("key file is not hex: {e}")))?;
        let key = Self::from_bytes(&raw);
        raw.zeroize();
        key
    }

    /// Write the key as hex, readable by the owner only. An existing key is
    /// never replaced.
    pub fn save_new(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                BackupError::Encryption(format!("key {} already exists", path.display()))
            } else {
                e.into()
            }
        })?;
        let mut encoded = hex::encode(self.bytes);
        let written = file.write_all(encoded.as_bytes()).and_then(|_| file.sync_all());
        encoded.zeroize();
        written?;
        Ok(())
    }

    /// Short non-secret identifier recorded next to uploads.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(self.bytes);
        hex::encode(&digest[..4])
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.bytes)
            .map_err(|e| BackupError::Encryption(format!("invalid key: {e}")))
    }
}

impl std::fmt::Debug for CloudKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CloudKey({})", self.fingerprint())
    }
}

fn aad(index: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = last as u8;
    aad
}

/// Fill `buf` as far as the reader allows.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Encrypt `source` into `destination`. Returns the bytes written.
pub fn encrypt_file(key: &CloudKey, source: &Path, destination: &Path) -> Result<u64> {
    let cipher = key.cipher()?;
    let mut reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(File::create(destination)?);
    writer.write_all(MAGIC)?;
    let mut written = MAGIC.len() as u64;

    let mut current = vec![0u8; CHUNK_SIZE];
    let mut next = vec![0u8; CHUNK_SIZE];
    let mut current_len = read_full(&mut reader, &mut current)?;
    let mut index = 0u64;

    loop {
        // Read ahead to learn whether this chunk is the last one
        let next_len = if current_len == CHUNK_SIZE {
            read_full(&mut reader, &mut next)?
        } else {
            0
        };
        let last = next_len == 0;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &current[..current_len],
                    aad: &aad(index, last),
                },
            )
            .map_err(|e| BackupError::Encryption(format!("chunk {index}: {e}")))?;

        writer.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        writer.write_all(&nonce)?;
        writer.write_all(&ciphertext)?;
        written += (4 + NONCE_SIZE + ciphertext.len()) as u64;

        if last {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
        index += 1;
    }

    current.zeroize();
    next.zeroize();
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(written)
}

/// Decrypt a file written by [`encrypt_file`].
pub fn decrypt_file(key: &CloudKey, source: &Path, destination: &Path) -> Result<u64> {
    let cipher = key.cipher()?;
    let corrupt = |reason: &str| BackupError::Encryption(format!("{}: {}", source.display(), reason));

    let mut reader = BufReader::new(File::open(source)?);
    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .map_err(|_| corrupt("missing header"))?;
    if &magic != MAGIC {
        return Err(corrupt("not an encrypted artifact"));
    }

    let mut writer = BufWriter::new(File::create(destination)?);
    let mut written = 0u64;
    let mut index = 0u64;
    let mut len_buf = [0u8; 4];
    let mut pending: Option<(Vec<u8>, [u8; NONCE_SIZE])> = None;

    loop {
        let n = read_full(&mut reader, &mut len_buf)?;
        if n == 0 {
            break;
        }
        if n != 4 {
            return Err(corrupt("truncated chunk header"));
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if !(TAG_SIZE..=CHUNK_SIZE + TAG_SIZE).contains(&len) {
            return Err(corrupt("invalid chunk length"));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        reader
            .read_exact(&mut nonce)
            .map_err(|_| corrupt("truncated nonce"))?;
        let mut ciphertext = vec![0u8; len];
        reader
            .read_exact(&mut ciphertext)
            .map_err(|_| corrupt("truncated chunk"))?;

        // A chunk is only known not to be last once another follows it
        if let Some((previous, previous_nonce)) = pending.replace((ciphertext, nonce)) {
            written += open_chunk(&cipher, &previous, &previous_nonce, index, false, &mut writer, &corrupt)?;
            index += 1;
        }
    }

    let (last, last_nonce) = pending.ok_or_else(|| corrupt("no chunks"))?;
    written += open_chunk(&cipher, &last, &last_nonce, index, true, &mut writer, &corrupt)?;

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(written)
}

fn open_chunk<W: Write>(
    cipher: &Aes256Gcm,
    ciphertext: &[u8],
    nonce: &[u8; NONCE_SIZE],
    index: u64,
    last: bool,
    writer: &mut W,
    corrupt: &dyn Fn(&str) -> BackupError,
) -> Result<u64> {
    let mut plain = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &aad(index, last),
            },
        )
        .map_err(|_| corrupt(&format!("chunk {index} failed authentication")))?;
    writer.write_all(&plain)?;
    let len = plain.len() as u64;
    plain.zeroize();
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn round_trip(data: &[u8]) -> Result<Vec<u8>> {
        let dir = TempDir::new()?;
        let key = CloudKey::generate();
        let plain = dir.path().join("plain");
        let sealed = dir.path().join("sealed");
        let opened = dir.path().join("opened");
        fs::write(&plain, data)?;

        encrypt_file(&key, &plain, &sealed)?;
        assert_eq!(&fs::read(&sealed)?[..8], MAGIC);
        decrypt_file(&key, &sealed, &opened)?;
        Ok(fs::read(opened)?)
    }

    #[test]
    fn test_empty_and_multi_chunk() -> Result<()> {
        assert_eq!(round_trip(b"")?, b"");
        let data: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        assert_eq!(round_trip(&data)?, data);
        let exact = vec![7u8; CHUNK_SIZE];
        assert_eq!(round_trip(&exact)?, exact);
        Ok(())
    }

    #[test]
    fn test_wrong_key_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let plain = dir.path().join("plain");
        let sealed = dir.path().join("sealed");
        fs::write(&plain, b"secret rows")?;
        encrypt_file(&CloudKey::generate(), &plain, &sealed)?;

        let err = decrypt_file(&CloudKey::generate(), &sealed, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, BackupError::Encryption(_)));
        Ok(())
    }

    #[test]
    fn test_truncation_detected() -> Result<()> {
        let dir = TempDir::new()?;
        let key = CloudKey::generate();
        let plain = dir.path().join("plain");
        let sealed = dir.path().join("sealed");
        fs::write(&plain, vec![1u8; CHUNK_SIZE + 10])?;
        encrypt_file(&key, &plain, &sealed)?;

        // Drop the final chunk: the remaining one was not sealed as last
        let bytes = fs::read(&sealed)?;
        let first_len = u32::from_be_bytes(bytes[8..12].try_into().unwrap()) as usize;
        fs::write(&sealed, &bytes[..8 + 4 + NONCE_SIZE + first_len])?;

        assert!(decrypt_file(&key, &sealed, &dir.path().join("out")).is_err());
        Ok(())
    }

    #[test]
    fn test_key_file_permissions_and_reload() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("keys/cloud.key");
        let key = CloudKey::generate();
        key.save_new(&path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
        }
        let loaded = CloudKey::load(&path)?;
        assert_eq!(loaded.fingerprint(), key.fingerprint());
        assert!(CloudKey::generate().save_new(&path).is_err());
        Ok(())
    }
}
