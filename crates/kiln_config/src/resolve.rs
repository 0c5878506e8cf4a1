//! Derived cache settings: the cache root and its size-limiting strategy.

use crate::error::ConfigError;
use crate::types::CacheSection;
use std::path::{Path, PathBuf};

/// Environment variable naming the process-wide default cache root.
pub const ENV_CACHE_ROOT: &str = "KILN_CACHE_ROOT";

/// Directory name used for derived cache roots.
pub const CACHE_DIR_NAME: &str = "CompilationCache.noindex";

/// How the compilation cache is kept within bounds after a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeLimit {
    /// The cache directory is removed once the build finishes.
    Discarded,
    /// At most this many bytes. `None` means unbounded.
    MaxBytes(Option<u64>),
    /// At most this percentage of the space available on the cache volume.
    MaxPercentOfAvailable(u8),
}

impl Default for SizeLimit {
    fn default() -> Self {
        SizeLimit::MaxPercentOfAvailable(50)
    }
}

impl SizeLimit {
    /// Computes the byte limit given the space available on the cache volume.
    ///
    /// Returns `None` when the cache is unbounded, discarded, or when the
    /// available space could not be determined.
    pub fn limit_bytes(self, available_space: Option<u64>) -> Option<u64> {
        match self {
            SizeLimit::Discarded => None,
            SizeLimit::MaxBytes(limit) => limit,
            SizeLimit::MaxPercentOfAvailable(0) => None,
            SizeLimit::MaxPercentOfAvailable(percent) => {
                available_space.map(|space| space / 100 * u64::from(percent))
            }
        }
    }
}

/// Parses a byte count with an optional binary suffix (`K`, `M`, `G`, `T`).
///
/// `"0"` parses to `Some(0)`, which callers treat as "no limit".
pub fn parse_size_limit(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Ok(value) = text.parse::<u64>() {
        return Some(value);
    }
    let unit = text.chars().last()?;
    let multiplier: u64 = match unit {
        'K' => 1 << 10,
        'M' => 1 << 20,
        'G' => 1 << 30,
        'T' => 1 << 40,
        _ => return None,
    };
    let value: u64 = text[..text.len() - unit.len_utf8()].parse().ok()?;
    value.checked_mul(multiplier)
}

/// Resolves the size-limiting strategy from the `[cache]` table.
///
/// `keep = false` wins, then `limit_size`, then `limit_percent`, then the default of 50%.
pub fn resolve_size_limit(cache: &CacheSection) -> Result<SizeLimit, ConfigError> {
    if !cache.keep {
        return Ok(SizeLimit::Discarded);
    }
    if let Some(text) = &cache.limit_size {
        let bytes = parse_size_limit(text).ok_or_else(|| ConfigError::InvalidSizeLimit {
            setting: "cache.limit_size".to_string(),
            value: text.clone(),
        })?;
        return Ok(SizeLimit::MaxBytes((bytes > 0).then_some(bytes)));
    }
    if let Some(percent) = cache.limit_percent {
        return Ok(SizeLimit::MaxPercentOfAvailable(percent));
    }
    Ok(SizeLimit::default())
}

/// Where the resolved cache root came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRootSource {
    /// `cache.path` was set explicitly.
    Override,
    /// Derived from the build root.
    Arena,
    /// The process-wide default.
    ProcessDefault,
}

/// A resolved cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRoot {
    /// The cache directory.
    pub path: PathBuf,
    /// Which rule produced it.
    pub source: CacheRootSource,
}

/// Resolves the cache root: explicit override, then build-arena default, then process default.
///
/// The process default is `$KILN_CACHE_ROOT` when `env_root` carries it, otherwise
/// the user cache directory. Systems without one fall back to the arena path.
pub fn resolve_cache_root(
    cache: &CacheSection,
    build_root: &Path,
    env_root: Option<PathBuf>,
) -> CacheRoot {
    if let Some(path) = &cache.path {
        return CacheRoot {
            path: path.clone(),
            source: CacheRootSource::Override,
        };
    }
    let arena = CacheRoot {
        path: build_root.join(CACHE_DIR_NAME),
        source: CacheRootSource::Arena,
    };
    if cache.arena_scoped {
        return arena;
    }
    let process_default = env_root
        .filter(|p| !p.as_os_str().is_empty())
        .or_else(|| dirs::cache_dir().map(|dir| dir.join("kiln").join(CACHE_DIR_NAME)));
    match process_default {
        Some(path) => CacheRoot {
            path,
            source: CacheRootSource::ProcessDefault,
        },
        None => arena,
    }
}
