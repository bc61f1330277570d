//! zstd-compressed tar bundle of a project's `current/` tree.

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::Result;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleInfo {
    pub files: usize,
    /// Uncompressed bytes
    pub bytes: u64,
    /// Bundle size on disk
    pub size: u64,
}

/// Write every regular file under `root` into a `.tar.zst` at `destination`.
pub fn bundle_tree(root: &Path, destination: &Path, level: i32) -> Result<BundleInfo> {
    let mut files = walk_directory(root, &WalkOptions::unfiltered())?;
    files.retain(|f| !f.is_symlink);
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let output = BufWriter::new(File::create(destination)?);
    let encoder = zstd::stream::write::Encoder::new(output, level)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut info = BundleInfo::default();
    for file in &files {
        builder.append_path_with_name(&file.path, &file.relative_path)?;
        info.files += 1;
        info.bytes += file.size;
    }

    let encoder = builder.into_inner()?;
    let output = encoder.finish()?;
    let file = output.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    info.size = file.metadata()?.len();
    debug!(files = info.files, size = info.size, "Bundle written to {}", destination.display());
    Ok(info)
}

/// Unpack a bundle into `destination`.
pub fn unbundle(bundle: &Path, destination: &Path) -> Result<()> {
    let decoder = zstd::stream::read::Decoder::new(BufReader::new(File::open(bundle)?))?;
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(destination)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_bundle_contains_tree() -> Result<()> {
        let src = TempDir::new()?;
        fs::create_dir_all(src.path().join("src/nested"))?;
        fs::write(src.path().join("a.txt"), b"alpha")?;
        fs::write(src.path().join("src/nested/b.rs"), b"fn main() {}")?;
        #[cfg(unix)]
        std::os::unix::fs::symlink("/etc/hosts", src.path().join("link"))?;

        let out = TempDir::new()?;
        let bundle = out.path().join("current.tar.zst");
        let info = bundle_tree(src.path(), &bundle, 3)?;
        assert_eq!(info.files, 2);
        assert_eq!(info.bytes, 5 + 12);

        let unpacked = out.path().join("unpacked");
        unbundle(&bundle, &unpacked)?;
        assert_eq!(fs::read(unpacked.join("src/nested/b.rs"))?, b"fn main() {}");
        assert!(!unpacked.join("link").exists());
        Ok(())
    }
}
