//! Directory traversal for project scans.
//!
//! Regenerable directories (build output, dependency caches, virtual
//! environments) are pruned without descending into them. Symbolic links are
//! reported but never followed.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Directory names that can always be regenerated and are never backed up.
pub const REGENERABLE_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "bower_components",
    "target",
    "build",
    "dist",
    "out",
    ".next",
    ".nuxt",
    ".svelte-kit",
    ".turbo",
    ".parcel-cache",
    ".cache",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".tox",
    ".venv",
    "venv",
    "env",
    ".gradle",
    ".terraform",
    "vendor",
    "coverage",
    "DerivedData",
    "Pods",
];

/// Files created by the operating system or file managers.
pub const HOUSEKEEPING_FILES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini", ".localized"];

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Directory names pruned from the walk
    pub exclude_dirs: Vec<String>,

    /// Skip OS housekeeping files
    pub skip_housekeeping: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_depth: None,
            exclude_dirs: REGENERABLE_DIRS.iter().map(|s| s.to_string()).collect(),
            skip_housekeeping: true,
        }
    }
}

impl WalkOptions {
    /// Default exclusions plus user-configured directory names.
    pub fn with_extra_excludes(extra: &[String]) -> Self {
        let mut options = Self::default();
        options.exclude_dirs.extend(extra.iter().cloned());
        options
    }

    /// Walk everything, used for backup destination trees.
    pub fn unfiltered() -> Self {
        Self {
            max_depth: None,
            exclude_dirs: Vec::new(),
            skip_housekeeping: true,
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes (link size for symlinks)
    pub size: u64,

    /// Last modification time
    pub modified: SystemTime,

    /// Is this a symlink?
    pub is_symlink: bool,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        // walkdir does not follow links, so this is the link's own metadata
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            is_symlink: entry.path_is_symlink(),
        })
    }
}

/// Walk a directory tree and collect all files and symlinks.
///
/// Unreadable entries are logged and skipped; only a failure to read the
/// root itself is an error.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_directory_with_callback(root, options, |file| files.push(file.clone()))?;
    Ok(files)
}

/// Walk a directory tree with a callback for each file (for progress reporting)
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(&FileInfo),
{
    std::fs::metadata(root)?;

    let mut walker = WalkDir::new(root).follow_links(false);
    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let iter = walker
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_excluded_dir(entry, &options.exclude_dirs));

    for entry in iter {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }
        if options.skip_housekeeping && is_housekeeping(&entry.file_name().to_string_lossy()) {
            continue;
        }

        match FileInfo::from_entry(&entry, root) {
            Ok(file_info) => callback(&file_info),
            Err(e) => warn!("Skipping {}: {}", entry.path().display(), e),
        }
    }

    Ok(())
}

/// Whether `dir` holds no real files. Missing directories count as empty and
/// housekeeping files are ignored, so a destination that only picked up a
/// `.DS_Store` still counts as never initialized.
pub fn is_effectively_empty(dir: &Path) -> bool {
    if !dir.exists() {
        return true;
    }
    for entry in WalkDir::new(dir).follow_links(false).into_iter().flatten() {
        if entry.file_type().is_dir() {
            continue;
        }
        if !is_housekeeping(&entry.file_name().to_string_lossy()) {
            return false;
        }
    }
    true
}

pub fn is_housekeeping(file_name: &str) -> bool {
    HOUSEKEEPING_FILES.contains(&file_name) || file_name.starts_with("._")
}

/// Whether any component of a relative path is an excluded directory name.
pub fn is_excluded_path(relative: &Path, exclude_dirs: &[String]) -> bool {
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        // The last component is the file itself
        if components.peek().is_none() {
            break;
        }
        let name = component.as_os_str().to_string_lossy();
        if exclude_dirs.iter().any(|d| d == name.as_ref()) {
            return true;
        }
    }
    false
}

fn is_excluded_dir(entry: &DirEntry, exclude_dirs: &[String]) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let file_name = entry.file_name().to_string_lossy();
    exclude_dirs.iter().any(|d| d == file_name.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn test_regenerable_dirs_pruned() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("node_modules/lib"))?;
        fs::create_dir_all(temp_dir.path().join("src/target"))?;
        fs::write(temp_dir.path().join("node_modules/lib/index.js"), b"x")?;
        fs::write(temp_dir.path().join("src/target/out.o"), b"x")?;
        fs::write(temp_dir.path().join("src/main.rs"), b"fn main() {}")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, PathBuf::from("src/main.rs"));
        Ok(())
    }

    #[test]
    fn test_extra_excludes() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("tmp"))?;
        fs::write(temp_dir.path().join("tmp/scratch"), b"x")?;
        fs::write(temp_dir.path().join("keep.txt"), b"x")?;

        let options = WalkOptions::with_extra_excludes(&["tmp".to_string()]);
        let files = walk_directory(temp_dir.path(), &options)?;
        assert_eq!(files.len(), 1);
        Ok(())
    }

    #[test]
    fn test_housekeeping_files_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("file.txt"), b"keep")?;
        fs::write(temp_dir.path().join(".DS_Store"), b"exclude")?;
        fs::write(temp_dir.path().join("._file.txt"), b"exclude")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path.to_str().unwrap(), "file.txt");
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_reported_not_followed() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let outside = TempDir::new()?;
        fs::write(outside.path().join("secret.txt"), b"outside")?;
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("escape"))?;
        std::os::unix::fs::symlink("a.txt", temp_dir.path().join("link.txt"))?;
        fs::write(temp_dir.path().join("a.txt"), b"a")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        let symlinks: Vec<_> = files.iter().filter(|f| f.is_symlink).collect();
        assert_eq!(files.len(), 3);
        assert_eq!(symlinks.len(), 2);
        assert!(!files.iter().any(|f| f.relative_path.ends_with("secret.txt")));
        Ok(())
    }

    #[test]
    fn test_effectively_empty() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        assert!(is_effectively_empty(&temp_dir.path().join("missing")));
        assert!(is_effectively_empty(temp_dir.path()));

        fs::create_dir(temp_dir.path().join("sub"))?;
        fs::write(temp_dir.path().join(".DS_Store"), b"x")?;
        fs::write(temp_dir.path().join("sub/Thumbs.db"), b"x")?;
        assert!(is_effectively_empty(temp_dir.path()));

        fs::write(temp_dir.path().join("sub/real.txt"), b"x")?;
        assert!(!is_effectively_empty(temp_dir.path()));
        Ok(())
    }

    #[test]
    fn test_is_excluded_path() {
        let excludes = vec!["node_modules".to_string()];
        assert!(is_excluded_path(Path::new("web/node_modules/x.js"), &excludes));
        assert!(!is_excluded_path(Path::new("web/src/node_modules"), &excludes));
        assert!(!is_excluded_path(Path::new("src/main.rs"), &excludes));
    }
}
