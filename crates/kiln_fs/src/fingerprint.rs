//! Stable content descriptors for build inputs and outputs.

use crate::error::FsError;
use crate::fs::FileSystem;
use kiln_common::{ContentHash, StableHasher};
use kiln_config::FingerprintMode;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// A comparable descriptor of a path's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fingerprint {
    /// The path does not exist.
    Missing,
    /// Hash of the file's bytes.
    Content(ContentHash),
    /// Size and modification time.
    Stat {
        /// Size in bytes.
        size: u64,
        /// Modification time in nanoseconds since the Unix epoch.
        modified_ns: u64,
    },
    /// Hash over the sorted relative paths and fingerprints of a directory's contents.
    Tree(ContentHash),
}

impl Fingerprint {
    /// Returns `true` for [`Fingerprint::Missing`].
    pub fn is_missing(&self) -> bool {
        matches!(self, Fingerprint::Missing)
    }

    /// Returns `true` for directory fingerprints.
    pub fn is_tree(&self) -> bool {
        matches!(self, Fingerprint::Tree(_))
    }

    /// Feeds this fingerprint into a hasher.
    pub fn hash_into(&self, hasher: &mut StableHasher) {
        match self {
            Fingerprint::Missing => {
                hasher.write_u64(0);
            }
            Fingerprint::Content(hash) => {
                hasher.write_u64(1).write_hash(hash);
            }
            Fingerprint::Stat { size, modified_ns } => {
                hasher.write_u64(2).write_u64(*size).write_u64(*modified_ns);
            }
            Fingerprint::Tree(hash) => {
                hasher.write_u64(3).write_hash(hash);
            }
        }
    }
}

/// Computes and memoizes fingerprints for one build.
///
/// A task that writes outputs must call [`invalidate`](Self::invalidate) for
/// them before consumers are decided, otherwise consumers see the old state.
///
/// A value computed while an invalidation ran is returned to its caller but
/// not memoized.
pub struct FingerprintStore {
    fs: Arc<dyn FileSystem>,
    mode: FingerprintMode,
    /// Bumped by every invalidation, always under the fingerprints lock.
    generation: AtomicU64,
    fingerprints: Mutex<HashMap<PathBuf, Fingerprint>>,
    contents: Mutex<HashMap<PathBuf, ContentHash>>,
}

impl FingerprintStore {
    /// Creates an empty store over the given filesystem.
    pub fn new(fs: Arc<dyn FileSystem>, mode: FingerprintMode) -> Self {
        Self {
            fs,
            mode,
            generation: AtomicU64::new(0),
            fingerprints: Mutex::new(HashMap::new()),
            contents: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the mode fingerprints are computed in.
    pub fn mode(&self) -> FingerprintMode {
        self.mode
    }

    /// Returns the filesystem the store reads from.
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Returns the fingerprint of `path`, computing it on first use.
    pub fn fingerprint(&self, path: &Path) -> Result<Fingerprint, FsError> {
        let generation = {
            let known = self.lock_fingerprints();
            if let Some(fingerprint) = known.get(path) {
                return Ok(*fingerprint);
            }
            self.generation.load(Ordering::SeqCst)
        };
        let computed = self.compute(path)?;
        let mut known = self.lock_fingerprints();
        if self.generation.load(Ordering::SeqCst) == generation {
            known.entry(path.to_path_buf()).or_insert(computed);
        }
        Ok(computed)
    }

    /// Fingerprints many paths in parallel, preserving input order.
    pub fn fingerprint_all(&self, paths: &[PathBuf]) -> Result<Vec<(PathBuf, Fingerprint)>, FsError> {
        paths
            .par_iter()
            .map(|path| Ok((path.clone(), self.fingerprint(path)?)))
            .collect()
    }

    /// Returns the content hash of a file regardless of the fingerprint mode.
    ///
    /// Cache keys always address content, so they use this even in timestamp mode.
    pub fn content_hash(&self, path: &Path) -> Result<ContentHash, FsError> {
        let generation = {
            let known = self.lock_contents();
            if let Some(hash) = known.get(path) {
                return Ok(*hash);
            }
            self.generation.load(Ordering::SeqCst)
        };
        let bytes = self.fs.read(path).map_err(|e| FsError::io(path, e))?;
        let hash = ContentHash::from_bytes(&bytes);
        let mut known = self.lock_contents();
        if self.generation.load(Ordering::SeqCst) == generation {
            known.entry(path.to_path_buf()).or_insert(hash);
        }
        Ok(hash)
    }

    /// Forgets memoized state for `path`, everything beneath it, and its ancestors.
    pub fn invalidate(&self, path: &Path) {
        let related = |known: &PathBuf| known.starts_with(path) || path.starts_with(known);
        {
            let mut fingerprints = self.lock_fingerprints();
            self.generation.fetch_add(1, Ordering::SeqCst);
            fingerprints.retain(|known, _| !related(known));
        }
        self.lock_contents().retain(|known, _| !related(known));
    }

    fn compute(&self, path: &Path) -> Result<Fingerprint, FsError> {
        let Some(stat) = self.fs.stat(path).map_err(|e| FsError::io(path, e))? else {
            return Ok(Fingerprint::Missing);
        };
        if stat.is_dir {
            return self.tree(path);
        }
        match self.mode {
            FingerprintMode::Content => Ok(Fingerprint::Content(self.content_hash(path)?)),
            FingerprintMode::Timestamp => Ok(Fingerprint::Stat {
                size: stat.size,
                modified_ns: stat.modified_ns,
            }),
        }
    }

    fn tree(&self, root: &Path) -> Result<Fingerprint, FsError> {
        let mut hasher = StableHasher::new("kiln-tree-v1");
        let mut pending = vec![root.to_path_buf()];
        let mut files = Vec::new();
        while let Some(dir) = pending.pop() {
            for child in self.fs.list_dir(&dir).map_err(|e| FsError::io(&dir, e))? {
                match self.fs.stat(&child).map_err(|e| FsError::io(&child, e))? {
                    Some(stat) if stat.is_dir => pending.push(child),
                    Some(_) => files.push(child),
                    None => {}
                }
            }
        }
        files.sort();
        debug!(path = %root.display(), files = files.len(), "fingerprinting directory");
        for file in files {
            let relative = file.strip_prefix(root).unwrap_or(&file).to_path_buf();
            let fingerprint = self.fingerprint(&file)?;
            hasher.write_path(&relative);
            fingerprint.hash_into(&mut hasher);
        }
        Ok(Fingerprint::Tree(hasher.finish()))
    }

    fn lock_fingerprints(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Fingerprint>> {
        self.fingerprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_contents(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, ContentHash>> {
        self.contents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;
    use std::time::{Duration, SystemTime};

    fn store(mode: FingerprintMode) -> FingerprintStore {
        FingerprintStore::new(Arc::new(LocalFs), mode)
    }

    fn set_mtime(path: &Path, secs: u64) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let fp = store(FingerprintMode::Content)
            .fingerprint(&dir.path().join("absent.c"))
            .unwrap();
        assert!(fp.is_missing());
    }

    #[test]
    fn content_mode_ignores_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.c");
        std::fs::write(&path, "int a;").unwrap();
        set_mtime(&path, 1_000);
        let before = store(FingerprintMode::Content).fingerprint(&path).unwrap();
        set_mtime(&path, 2_000);
        let after = store(FingerprintMode::Content).fingerprint(&path).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn timestamp_mode_sees_touch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.c");
        std::fs::write(&path, "int a;").unwrap();
        set_mtime(&path, 1_000);
        let before = store(FingerprintMode::Timestamp).fingerprint(&path).unwrap();
        set_mtime(&path, 2_000);
        let after = store(FingerprintMode::Timestamp).fingerprint(&path).unwrap();
        assert_ne!(before, after);
        assert!(matches!(after, Fingerprint::Stat { size: 6, .. }));
    }

    #[test]
    fn memoized_until_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.o");
        std::fs::write(&path, "v1").unwrap();
        let store = store(FingerprintMode::Content);
        let first = store.fingerprint(&path).unwrap();
        std::fs::write(&path, "v2").unwrap();
        assert_eq!(store.fingerprint(&path).unwrap(), first);
        store.invalidate(&path);
        assert_ne!(store.fingerprint(&path).unwrap(), first);
    }

    /// Rewrites a file and invalidates it in the middle of the first read,
    /// the way a producing task racing a consumer's decision would.
    struct RewriteDuringRead {
        store: std::sync::OnceLock<std::sync::Weak<FingerprintStore>>,
        rewrite: Mutex<Option<(PathBuf, &'static str)>>,
    }

    impl FileSystem for RewriteDuringRead {
        fn stat(&self, path: &Path) -> std::io::Result<Option<crate::fs::FileStat>> {
            LocalFs.stat(path)
        }

        fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
            let bytes = LocalFs.read(path)?;
            let pending = self.rewrite.lock().unwrap().take();
            if let Some((target, data)) = pending {
                std::fs::write(&target, data)?;
                if let Some(store) = self.store.get().and_then(|s| s.upgrade()) {
                    store.invalidate(&target);
                }
            }
            Ok(bytes)
        }

        fn write(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
            LocalFs.write(path, data)
        }

        fn remove(&self, path: &Path) -> std::io::Result<()> {
            LocalFs.remove(path)
        }

        fn list_dir(&self, path: &Path) -> std::io::Result<Vec<PathBuf>> {
            LocalFs.list_dir(path)
        }

        fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
            LocalFs.create_dir_all(path)
        }

        fn available_space(&self, path: &Path) -> Option<u64> {
            LocalFs.available_space(path)
        }
    }

    #[test]
    fn invalidation_during_compute_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gen.h");
        std::fs::write(&path, "old").unwrap();
        let fs = Arc::new(RewriteDuringRead {
            store: std::sync::OnceLock::new(),
            rewrite: Mutex::new(Some((path.clone(), "new"))),
        });
        let store = Arc::new(FingerprintStore::new(fs.clone(), FingerprintMode::Content));
        fs.store.set(Arc::downgrade(&store)).unwrap();

        // The racing read still answers with what it saw.
        let stale = store.fingerprint(&path).unwrap();
        assert_eq!(stale, Fingerprint::Content(ContentHash::from_bytes(b"old")));

        // The next query must not be served from the stale value.
        let fresh = store.fingerprint(&path).unwrap();
        assert_eq!(fresh, Fingerprint::Content(ContentHash::from_bytes(b"new")));
        assert_eq!(store.content_hash(&path).unwrap(), ContentHash::from_bytes(b"new"));
    }

    #[test]
    fn tree_fingerprint_tracks_contents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("headers");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.h"), "a").unwrap();
        std::fs::write(root.join("sub/b.h"), "b").unwrap();

        let store = store(FingerprintMode::Content);
        let first = store.fingerprint(&root).unwrap();
        assert!(first.is_tree());

        std::fs::write(root.join("sub/b.h"), "changed").unwrap();
        store.invalidate(&root.join("sub/b.h"));
        let second = store.fingerprint(&root).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn fingerprint_all_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..8).map(|i| dir.path().join(format!("f{i}"))).collect();
        for (i, path) in paths.iter().enumerate() {
            std::fs::write(path, i.to_string()).unwrap();
        }
        let all = store(FingerprintMode::Content).fingerprint_all(&paths).unwrap();
        let order: Vec<&PathBuf> = all.iter().map(|(p, _)| p).collect();
        assert_eq!(order, paths.iter().collect::<Vec<_>>());
    }

    #[test]
    fn content_hash_in_timestamp_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, "same").unwrap();
        let store = store(FingerprintMode::Timestamp);
        assert_eq!(
            store.content_hash(&path).unwrap(),
            ContentHash::from_bytes(b"same")
        );
    }
}
