//! Cache key computation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use kiln_common::{ContentHash, StableHasher};
use kiln_plan::CacheKind;
use serde::{Deserialize, Serialize};

use crate::remap::PathRemapper;

/// Content address of a cache entry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey(ContentHash);

impl CacheKey {
    /// Wraps a precomputed hash.
    pub fn from_hash(hash: ContentHash) -> Self {
        Self(hash)
    }

    /// Parses the hex form used in entry file names.
    pub fn from_hex(text: &str) -> Option<Self> {
        ContentHash::from_hex(text).map(Self)
    }

    /// Returns the underlying hash.
    pub fn hash(&self) -> ContentHash {
        self.0
    }

    /// Returns the two-character shard directory name.
    pub(crate) fn shard(&self) -> String {
        format!("{:02x}", self.0.as_bytes()[0])
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.0.short())
    }
}

/// Everything about a compilation that may affect its result.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    /// Which cache the entry lives in.
    pub kind: CacheKind,
    /// Full command line, program first.
    pub command: Vec<String>,
    /// Environment subset passed to the tool.
    pub environment: BTreeMap<String, String>,
    /// Working directory the tool runs in.
    pub working_directory: PathBuf,
    /// Input paths with their content hashes.
    pub inputs: Vec<(PathBuf, ContentHash)>,
    /// Hash over discovered module keys, if the task was scanned.
    pub dependencies: Option<ContentHash>,
}

/// Turns [`KeyMaterial`] into a [`CacheKey`] that is stable across checkouts.
#[derive(Debug, Clone, Default)]
pub struct KeyCanonicalizer {
    remapper: PathRemapper,
    fold_working_directory: bool,
}

impl KeyCanonicalizer {
    /// Creates a canonicalizer.
    ///
    /// With `fold_working_directory`, the working directory is replaced by `/`
    /// whenever no argument refers to a relative path.
    pub fn new(remapper: PathRemapper, fold_working_directory: bool) -> Self {
        Self {
            remapper,
            fold_working_directory,
        }
    }

    /// Returns the path remapper.
    pub fn remapper(&self) -> &PathRemapper {
        &self.remapper
    }

    /// Computes the cache key.
    pub fn key(&self, material: &KeyMaterial) -> CacheKey {
        let mut hasher = StableHasher::new("kiln.cache-key.v1");
        hasher.write_str(material.kind.as_str());

        let command: Vec<String> = material
            .command
            .iter()
            .map(|arg| self.remapper.remap_arg(arg))
            .collect();
        hasher.write_strs(&command);

        hasher.write_u64(material.environment.len() as u64);
        for (name, value) in &material.environment {
            hasher.write_str(name).write_str(&self.remapper.remap_arg(value));
        }

        hasher.write_path(&self.canonical_working_directory(material));

        let mut inputs: Vec<(PathBuf, ContentHash)> = material
            .inputs
            .iter()
            .map(|(path, hash)| (self.remapper.remap_path(path), *hash))
            .collect();
        inputs.sort();
        hasher.write_u64(inputs.len() as u64);
        for (path, hash) in &inputs {
            hasher.write_path(path).write_hash(hash);
        }

        match &material.dependencies {
            Some(hash) => hasher.write_u64(1).write_hash(hash),
            None => hasher.write_u64(0),
        };
        CacheKey(hasher.finish())
    }

    /// The canonical name under which an output is stored in an entry.
    pub fn output_name(&self, path: &Path) -> String {
        self.remapper.remap_path(path).to_string_lossy().into_owned()
    }

    fn canonical_working_directory(&self, material: &KeyMaterial) -> PathBuf {
        if self.fold_working_directory
            && !material.command.iter().skip(1).any(|arg| depends_on_working_directory(arg))
        {
            return PathBuf::from("/");
        }
        self.remapper.remap_path(&material.working_directory)
    }
}

/// Returns `true` if an argument names a path relative to the working directory.
fn depends_on_working_directory(arg: &str) -> bool {
    let value = if let Some((_, value)) = arg.split_once('=') {
        value
    } else if arg.starts_with('-') {
        // `-Iinclude` style: option letter followed directly by the value.
        arg.get(2..).unwrap_or("")
    } else {
        arg
    };
    !value.is_empty()
        && !value.starts_with('/')
        && (value.contains('/') || value.contains('.'))
}
