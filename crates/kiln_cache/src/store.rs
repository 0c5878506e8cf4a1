//! The on-disk content-addressed store.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/instance-id
//! <root>/<kind>/objects/<2 hex>/<key>.entry
//! <root>/<kind>/locks/<key>.lock
//! <root>/<kind>/tmp/
//! ```
//!
//! Readers hold a shared lock on the key's lock file, writers and the pruner
//! an exclusive one. A lock file lives as long as its entry: whoever deletes
//! the entry unlinks the lock file while still holding it exclusively, and a
//! locker that wakes up on an unlinked lock file retries on the current one.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs4::fs_std::FileExt;
use kiln_common::StableHasher;
use kiln_plan::CacheKind;
use tracing::{debug, warn};

use crate::entry::{decode_entry, encode_entry, CacheEntry};
use crate::error::CacheError;
use crate::key::CacheKey;

const INSTANCE_ID_FILE: &str = "instance-id";
const INSTANCE_LOCK_FILE: &str = "instance-id.lock";
const OBJECTS_DIR: &str = "objects";
const LOCKS_DIR: &str = "locks";
const TMP_DIR: &str = "tmp";
const ENTRY_EXTENSION: &str = "entry";

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The entry was found and validated.
    Hit(CacheEntry),
    /// No usable entry exists.
    Miss,
}

impl Lookup {
    /// Returns `true` for a hit.
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

/// Result of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// A new entry was written.
    Stored,
    /// An entry for the key already existed and was left untouched.
    AlreadyPresent,
}

/// What a prune pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneSummary {
    /// Total entry bytes before pruning.
    pub size_before: u64,
    /// Total entry bytes after pruning.
    pub size_after: u64,
    /// The limit that was enforced.
    pub limit: u64,
    /// Number of entries removed.
    pub removed: usize,
    /// Entries skipped because another process held their lock.
    pub skipped_locked: usize,
    /// Entries kept because a task still references them.
    pub kept_referenced: usize,
}

impl PruneSummary {
    /// Returns `true` if the cache was larger than the limit before pruning.
    pub fn was_over_limit(&self) -> bool {
        self.size_before > self.limit
    }

    /// Returns `true` if the limit could not be reached.
    pub fn still_over_limit(&self) -> bool {
        self.size_after > self.limit
    }

    /// The remark emitted when pruning had work to do.
    pub fn remark(&self) -> Option<String> {
        self.was_over_limit().then(|| {
            format!(
                "cache size ({}) larger than size limit ({})",
                self.size_before, self.limit
            )
        })
    }
}

/// One entry found while walking the store.
#[derive(Debug, Clone)]
struct StoredEntry {
    kind: CacheKind,
    key: CacheKey,
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// A compilation cache rooted at one directory.
///
/// The value is cheap to share between threads; every operation goes to disk.
#[derive(Debug)]
pub struct CompilationCache {
    root: PathBuf,
    instance_id: String,
}

impl CompilationCache {
    /// Opens the cache at `root`, creating it and its instance id if needed.
    ///
    /// Any failure is reported as [`CacheError::Unavailable`]; callers run
    /// without a cache in that case.
    pub fn open(root: &Path) -> Result<Self, CacheError> {
        let unavailable = |reason: String| CacheError::Unavailable {
            root: root.to_path_buf(),
            reason,
        };
        fs::create_dir_all(root).map_err(|e| unavailable(e.to_string()))?;
        for kind in CacheKind::ALL {
            for dir in [OBJECTS_DIR, LOCKS_DIR, TMP_DIR] {
                let path = root.join(kind.as_str()).join(dir);
                fs::create_dir_all(&path).map_err(|e| unavailable(e.to_string()))?;
            }
        }
        let instance_id = read_or_create_instance_id(root).map_err(|e| unavailable(e.to_string()))?;
        debug!(root = %root.display(), %instance_id, "opened compilation cache");
        Ok(Self {
            root: root.to_path_buf(),
            instance_id,
        })
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Identifier written when this cache root was created.
    ///
    /// A different id on a later build means the cache was deleted in between.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Looks up an entry.
    ///
    /// Corrupt entries are removed and reported as misses. A hit refreshes
    /// the entry's modification time, which pruning uses as its age.
    pub fn lookup(&self, kind: CacheKind, key: &CacheKey) -> Result<Lookup, CacheError> {
        let path = self.entry_path(kind, key);
        if !path.exists() {
            debug!(%key, "cache miss");
            return Ok(Lookup::Miss);
        }
        let raw = {
            let lock = self.acquire_lock(kind, key, false)?;
            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(%key, "cache miss");
                    return Ok(Lookup::Miss);
                }
                Err(e) => return Err(CacheError::io(&path, e)),
            };
            touch(&path);
            drop(lock);
            raw
        };

        match decode_entry(&path, &raw) {
            Ok(entry) => {
                debug!(%key, outputs = entry.outputs.len(), "cache hit");
                Ok(Lookup::Hit(entry))
            }
            Err(err) => {
                warn!(%key, %err, "discarding unreadable cache entry");
                self.remove(kind, key)?;
                Ok(Lookup::Miss)
            }
        }
    }

    /// Stores an entry. Storing a key that already exists is a no-op.
    pub fn store(
        &self,
        kind: CacheKind,
        key: &CacheKey,
        entry: &CacheEntry,
    ) -> Result<StoreOutcome, CacheError> {
        let dest = self.entry_path(kind, key);
        let _lock = self.acquire_lock(kind, key, true)?;
        if dest.exists() {
            debug!(%key, "cache entry already present");
            return Ok(StoreOutcome::AlreadyPresent);
        }
        let bytes = encode_entry(entry)?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        let tmp = self
            .root
            .join(kind.as_str())
            .join(TMP_DIR)
            .join(format!("{key}.{}.partial", std::process::id()));
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        publish(&tmp, &dest, &bytes)?;
        debug!(%key, bytes = bytes.len(), "stored cache entry");
        Ok(StoreOutcome::Stored)
    }

    /// Removes an entry if present.
    pub fn remove(&self, kind: CacheKind, key: &CacheKey) -> Result<bool, CacheError> {
        let path = self.entry_path(kind, key);
        let _lock = self.acquire_lock(kind, key, true)?;
        let removed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(CacheError::io(&path, e)),
        };
        self.unlink_lock_file(kind, key);
        Ok(removed)
    }

    /// Total size in bytes of all entries.
    pub fn size(&self) -> Result<u64, CacheError> {
        Ok(self.entries()?.iter().map(|e| e.size).sum())
    }

    /// Removes the least recently used unreferenced entries until the cache
    /// fits in `limit` bytes.
    ///
    /// Entries whose keys appear in `referenced` are never removed. Entries
    /// locked by another reader or writer are skipped.
    pub fn prune(
        &self,
        limit: u64,
        referenced: &HashSet<CacheKey>,
    ) -> Result<PruneSummary, CacheError> {
        let mut entries = self.entries()?;
        let size_before: u64 = entries.iter().map(|e| e.size).sum();
        let mut summary = PruneSummary {
            size_before,
            size_after: size_before,
            limit,
            ..PruneSummary::default()
        };
        if size_before <= limit {
            return Ok(summary);
        }

        entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.key.cmp(&b.key)));
        let mut current = size_before;
        for entry in entries {
            if current <= limit {
                break;
            }
            if referenced.contains(&entry.key) {
                summary.kept_referenced += 1;
                continue;
            }
            let Some(_lock) = self.try_lock_for_prune(entry.kind, &entry.key)? else {
                summary.skipped_locked += 1;
                continue;
            };
            match fs::remove_file(&entry.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&entry.path, e)),
            }
            self.unlink_lock_file(entry.kind, &entry.key);
            debug!(key = %entry.key, size = entry.size, "pruned cache entry");
            current = current.saturating_sub(entry.size);
            summary.removed += 1;
        }
        summary.size_after = current;

        if summary.still_over_limit() {
            warn!(
                remaining_bytes = current,
                limit_bytes = limit,
                referenced = summary.kept_referenced,
                locked = summary.skipped_locked,
                "compilation cache could not be pruned below its size limit"
            );
        } else {
            debug!(
                removed = summary.removed,
                size_before,
                size_after = current,
                "compilation cache pruned"
            );
        }
        Ok(summary)
    }

    /// Deletes the whole cache directory.
    pub fn discard(&self) -> Result<(), CacheError> {
        debug!(root = %self.root.display(), "discarding compilation cache");
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(&self.root, e)),
        }
    }

    fn entry_path(&self, kind: CacheKind, key: &CacheKey) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join(OBJECTS_DIR)
            .join(key.shard())
            .join(format!("{key}.{ENTRY_EXTENSION}"))
    }

    fn lock_path(&self, kind: CacheKind, key: &CacheKey) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join(LOCKS_DIR)
            .join(format!("{key}.lock"))
    }

    fn open_lock_file(&self, kind: CacheKind, key: &CacheKey) -> Result<File, CacheError> {
        let path = self.lock_path(kind, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CacheError::io(&path, e))
    }

    fn acquire_lock(
        &self,
        kind: CacheKind,
        key: &CacheKey,
        exclusive: bool,
    ) -> Result<File, CacheError> {
        let path = self.lock_path(kind, key);
        loop {
            let file = self.open_lock_file(kind, key)?;
            let locked = if exclusive {
                FileExt::lock_exclusive(&file)
            } else {
                FileExt::lock_shared(&file)
            };
            locked.map_err(|e| CacheError::io(&path, e))?;
            if is_current_lock(&file, &path) {
                return Ok(file);
            }
            debug!(%key, "lock file was removed while waiting, retrying");
        }
    }

    fn try_lock_for_prune(&self, kind: CacheKind, key: &CacheKey) -> Result<Option<File>, CacheError> {
        let path = self.lock_path(kind, key);
        let file = self.open_lock_file(kind, key)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) if is_current_lock(&file, &path) => Ok(Some(file)),
            Ok(()) => Ok(None),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    /// Deletes the lock file of an entry that is gone. The caller holds it
    /// exclusively.
    fn unlink_lock_file(&self, kind: CacheKind, key: &CacheKey) {
        let path = self.lock_path(kind, key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!(path = %path.display(), %err, "could not remove lock file"),
        }
    }

    fn entries(&self) -> Result<Vec<StoredEntry>, CacheError> {
        let mut entries = Vec::new();
        for kind in CacheKind::ALL {
            let objects = self.root.join(kind.as_str()).join(OBJECTS_DIR);
            for shard in read_dir_sorted(&objects)? {
                if !shard.is_dir() {
                    continue;
                }
                for path in read_dir_sorted(&shard)? {
                    if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                        continue;
                    }
                    let Some(key) = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(CacheKey::from_hex)
                    else {
                        continue;
                    };
                    let metadata = match fs::metadata(&path) {
                        Ok(metadata) => metadata,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(CacheError::io(&path, e)),
                    };
                    entries.push(StoredEntry {
                        kind,
                        key,
                        size: metadata.len(),
                        modified: metadata.modified().unwrap_or(UNIX_EPOCH),
                        path,
                    });
                }
            }
        }
        Ok(entries)
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, CacheError> {
    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CacheError::io(dir, e)),
    };
    let mut paths = Vec::new();
    for item in reader {
        paths.push(item.map_err(|e| CacheError::io(dir, e))?.path());
    }
    paths.sort();
    Ok(paths)
}

/// Whether `file` is still the lock file at `path` and not one unlinked by
/// a concurrent remover.
#[cfg(unix)]
fn is_current_lock(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(named)) => held.dev() == named.dev() && held.ino() == named.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_current_lock(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// Writes `bytes` to `tmp` and renames it over `dest`. The partial file is
/// removed when any step fails.
fn publish(tmp: &Path, dest: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let written = File::create(tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .map_err(|e| CacheError::io(tmp, e))
        .and_then(|()| fs::rename(tmp, dest).map_err(|e| CacheError::io(dest, e)));
    if written.is_err() {
        if let Err(err) = fs::remove_file(tmp) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %tmp.display(), %err, "could not remove partial cache entry");
            }
        }
    }
    written
}

/// Marks an entry as recently used.
fn touch(path: &Path) {
    let result = OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(err) = result {
        debug!(path = %path.display(), %err, "could not refresh cache entry time");
    }
}

fn read_or_create_instance_id(root: &Path) -> std::io::Result<String> {
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(root.join(INSTANCE_LOCK_FILE))?;
    FileExt::lock_exclusive(&lock)?;

    let path = root.join(INSTANCE_ID_FILE);
    match fs::read_to_string(&path) {
        Ok(text) if !text.trim().is_empty() => return Ok(text.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let id = StableHasher::new("kiln.cache-instance")
        .write_path(root)
        .write_str(&nanos.to_string())
        .write_u64(u64::from(std::process::id()))
        .finish()
        .to_string();
    let tmp = root.join(format!("{INSTANCE_ID_FILE}.{}.partial", std::process::id()));
    fs::write(&tmp, format!("{id}\n"))?;
    fs::rename(&tmp, &path)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::OutputBlob;
    use kiln_common::ContentHash;
    use std::time::Duration;

    fn key(n: u8) -> CacheKey {
        CacheKey::from_hash(ContentHash::from_bytes(&[n]))
    }

    fn entry(data: &[u8]) -> CacheEntry {
        CacheEntry {
            outputs: vec![OutputBlob {
                name: "/^build/out.o".to_string(),
                data: data.to_vec(),
            }],
            diagnostics: Vec::new(),
        }
    }

    fn age(cache: &CompilationCache, kind: CacheKind, key: &CacheKey, secs_ago: u64) {
        let path = cache.entry_path(kind, key);
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .unwrap();
    }

    #[test]
    fn miss_then_store_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(dir.path()).unwrap();
        let k = key(1);
        assert_eq!(cache.lookup(CacheKind::Compile, &k).unwrap(), Lookup::Miss);
        assert_eq!(
            cache.store(CacheKind::Compile, &k, &entry(b"obj")).unwrap(),
            StoreOutcome::Stored
        );
        assert_eq!(
            cache.lookup(CacheKind::Compile, &k).unwrap(),
            Lookup::Hit(entry(b"obj"))
        );
        // Kinds are separate namespaces.
        assert_eq!(cache.lookup(CacheKind::Generic, &k).unwrap(), Lookup::Miss);
    }

    #[test]
    fn second_store_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(dir.path()).unwrap();
        let k = key(2);
        cache.store(CacheKind::Compile, &k, &entry(b"first")).unwrap();
        assert_eq!(
            cache.store(CacheKind::Compile, &k, &entry(b"second")).unwrap(),
            StoreOutcome::AlreadyPresent
        );
        assert_eq!(
            cache.lookup(CacheKind::Compile, &k).unwrap(),
            Lookup::Hit(entry(b"first"))
        );
    }

    #[test]
    fn corrupt_entry_is_a_miss_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(dir.path()).unwrap();
        let k = key(3);
        cache.store(CacheKind::Compile, &k, &entry(b"obj")).unwrap();
        let path = cache.entry_path(CacheKind::Compile, &k);
        fs::write(&path, b"garbage").unwrap();
        assert_eq!(cache.lookup(CacheKind::Compile, &k).unwrap(), Lookup::Miss);
        assert!(!path.exists());
    }

    #[test]
    fn instance_id_is_stable_until_root_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cas");
        let first = CompilationCache::open(&root).unwrap().instance_id().to_string();
        let again = CompilationCache::open(&root).unwrap().instance_id().to_string();
        assert_eq!(first, again);

        fs::remove_dir_all(&root).unwrap();
        let recreated = CompilationCache::open(&root).unwrap().instance_id().to_string();
        assert_ne!(first, recreated);
    }

    #[test]
    fn unusable_root_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        let err = CompilationCache::open(&file).unwrap_err();
        assert!(matches!(err, CacheError::Unavailable { .. }));
    }

    #[test]
    fn prune_removes_oldest_unreferenced_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(dir.path()).unwrap();
        let (old, mid, new) = (key(10), key(11), key(12));
        for (k, secs) in [(&old, 300), (&mid, 200), (&new, 100)] {
            cache.store(CacheKind::Compile, k, &entry(&[0u8; 64])).unwrap();
            age(&cache, CacheKind::Compile, k, secs);
        }
        let one = cache.size().unwrap() / 3;

        let summary = cache.prune(one * 2, &HashSet::new()).unwrap();
        assert_eq!(summary.removed, 1);
        assert!(summary.was_over_limit());
        assert!(!summary.still_over_limit());
        assert_eq!(cache.lookup(CacheKind::Compile, &old).unwrap(), Lookup::Miss);
        assert!(cache.lookup(CacheKind::Compile, &mid).unwrap().is_hit());
        assert!(cache.lookup(CacheKind::Compile, &new).unwrap().is_hit());
    }

    #[test]
    fn prune_never_removes_referenced_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(dir.path()).unwrap();
        let (a, b) = (key(20), key(21));
        cache.store(CacheKind::Compile, &a, &entry(&[1u8; 64])).unwrap();
        cache.store(CacheKind::Generic, &b, &entry(&[2u8; 64])).unwrap();
        age(&cache, CacheKind::Compile, &a, 500);

        let referenced: HashSet<CacheKey> = [a].into_iter().collect();
        let summary = cache.prune(0, &referenced).unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.kept_referenced, 1);
        assert!(summary.still_over_limit());
        assert!(cache.lookup(CacheKind::Compile, &a).unwrap().is_hit());
        assert_eq!(cache.lookup(CacheKind::Generic, &b).unwrap(), Lookup::Miss);
    }

    #[test]
    fn prune_skips_locked_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(dir.path()).unwrap();
        let k = key(30);
        cache.store(CacheKind::Compile, &k, &entry(&[3u8; 64])).unwrap();

        let reader = cache.acquire_lock(CacheKind::Compile, &k, false).unwrap();
        let summary = cache.prune(0, &HashSet::new()).unwrap();
        assert_eq!(summary.skipped_locked, 1);
        assert_eq!(summary.removed, 0);
        drop(reader);

        let summary = cache.prune(0, &HashSet::new()).unwrap();
        assert_eq!(summary.removed, 1);
    }

    #[test]
    fn prune_under_limit_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(dir.path()).unwrap();
        cache.store(CacheKind::Compile, &key(40), &entry(b"x")).unwrap();
        let summary = cache.prune(u64::MAX, &HashSet::new()).unwrap();
        assert_eq!(summary.removed, 0);
        assert_eq!(summary.remark(), None);
    }

    #[test]
    fn remark_reports_size_and_limit() {
        let summary = PruneSummary {
            size_before: 2048,
            size_after: 1024,
            limit: 1024,
            ..PruneSummary::default()
        };
        assert_eq!(
            summary.remark().as_deref(),
            Some("cache size (2048) larger than size limit (1024)")
        );
    }

    #[test]
    #[tracing_test::traced_test]
    fn warns_when_limit_cannot_be_reached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(dir.path()).unwrap();
        let k = key(50);
        cache.store(CacheKind::Compile, &k, &entry(&[5u8; 64])).unwrap();
        let referenced: HashSet<CacheKey> = [k].into_iter().collect();
        cache.prune(1, &referenced).unwrap();
        assert!(logs_contain("could not be pruned below its size limit"));
    }

    fn lock_files(cache: &CompilationCache, kind: CacheKind) -> usize {
        fs::read_dir(cache.root().join(kind.as_str()).join(LOCKS_DIR))
            .unwrap()
            .count()
    }

    #[test]
    fn lookups_and_prune_leave_no_lock_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(dir.path()).unwrap();
        for n in 0..200u8 {
            let k = key(n);
            assert_eq!(cache.lookup(CacheKind::Compile, &k).unwrap(), Lookup::Miss);
            if n % 2 == 0 {
                cache.store(CacheKind::Compile, &k, &entry(&[n; 16])).unwrap();
            }
        }
        assert_eq!(lock_files(&cache, CacheKind::Compile), 100);

        let summary = cache.prune(0, &HashSet::new()).unwrap();
        assert_eq!(summary.removed, 100);
        assert_eq!(lock_files(&cache, CacheKind::Compile), 0);
    }

    #[test]
    fn remove_deletes_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(dir.path()).unwrap();
        let k = key(70);
        cache.store(CacheKind::Generic, &k, &entry(b"x")).unwrap();
        assert_eq!(lock_files(&cache, CacheKind::Generic), 1);
        assert!(cache.remove(CacheKind::Generic, &k).unwrap());
        assert_eq!(lock_files(&cache, CacheKind::Generic), 0);

        // The key is usable again afterwards.
        cache.store(CacheKind::Generic, &k, &entry(b"y")).unwrap();
        assert_eq!(
            cache.lookup(CacheKind::Generic, &k).unwrap(),
            Lookup::Hit(entry(b"y"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn lock_on_an_unlinked_file_is_not_current() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompilationCache::open(dir.path()).unwrap();
        let k = key(80);
        let stale = cache.open_lock_file(CacheKind::Compile, &k).unwrap();
        let path = cache.lock_path(CacheKind::Compile, &k);
        assert!(is_current_lock(&stale, &path));
        fs::remove_file(&path).unwrap();
        assert!(!is_current_lock(&stale, &path));
        let fresh = cache.acquire_lock(CacheKind::Compile, &k, true).unwrap();
        assert!(is_current_lock(&fresh, &path));
    }

    #[test]
    fn failed_publish_removes_the_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("k.partial");
        let dest = dir.path().join("missing-shard").join("k.entry");
        let err = publish(&tmp, &dest, b"obj").unwrap_err();
        assert!(matches!(err, CacheError::Io { .. }));
        assert!(!tmp.exists());
        assert!(!dest.exists());
    }

    #[test]
    fn discard_removes_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cas");
        let cache = CompilationCache::open(&root).unwrap();
        cache.store(CacheKind::Compile, &key(60), &entry(b"x")).unwrap();
        cache.discard().unwrap();
        assert!(!root.exists());
    }
}
