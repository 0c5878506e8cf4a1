//! The filesystem boundary used by fingerprinting, the state store and the cache.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

/// Stat information for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes. Zero for directories.
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub modified_ns: u64,
    /// Whether the path is a directory.
    pub is_dir: bool,
}

/// Filesystem primitives needed by the build core.
///
/// Implementations must be shareable across scheduler worker threads.
pub trait FileSystem: Send + Sync {
    /// Returns stat information, or `None` if the path does not exist.
    fn stat(&self, path: &Path) -> io::Result<Option<FileStat>>;

    /// Reads a whole file.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Writes a whole file, creating parent directories.
    ///
    /// Readers never observe a partially written file.
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Removes a file or a directory tree. Missing paths are not an error.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Lists the entries of a directory, sorted by path.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Creates a directory and all of its parents.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Returns the bytes available to unprivileged users on the volume holding `path`.
    fn available_space(&self, path: &Path) -> Option<u64>;
}

/// [`FileSystem`] backed by the host operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns a sibling path for staging a write to `path`.
pub(crate) fn staging_path(path: &Path) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp-{}-{n}", std::process::id()))
}

impl FileSystem for LocalFs {
    fn stat(&self, path: &Path) -> io::Result<Option<FileStat>> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let modified_ns = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Ok(Some(FileStat {
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified_ns,
            is_dir: meta.is_dir(),
        }))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let staging = staging_path(path);
        if let Err(e) = std::fs::write(&staging, data) {
            let _ = std::fs::remove_file(&staging);
            return Err(e);
        }
        std::fs::rename(&staging, path).inspect_err(|_| {
            let _ = std::fs::remove_file(&staging);
        })
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let result = match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
            Ok(_) => std::fs::remove_file(path),
            Err(e) => Err(e),
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn available_space(&self, path: &Path) -> Option<u64> {
        let target = existing_ancestor(path)?;
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().components().count())
            .map(|disk| disk.available_space())
    }
}

/// Canonicalizes the closest existing ancestor of `path`.
fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find_map(|candidate| std::fs::canonicalize(candidate).ok())
}
