//! Strongly-typed representation of `kiln.toml`.
//!
//! Every table and field is optional; an empty file yields the defaults.

use serde::Deserialize;
use std::path::PathBuf;

/// Top-level build configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// General build settings.
    #[serde(default)]
    pub build: BuildSection,
    /// Compilation cache settings.
    #[serde(default)]
    pub cache: CacheSection,
    /// Explicit module build settings.
    #[serde(default)]
    pub modules: ModulesSection,
    /// Path prefixes rewritten to placeholders in cache keys.
    #[serde(default)]
    pub remap: RemapSection,
}

/// How file inputs are fingerprinted.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
    /// Hash file contents. Robust where modification times are unreliable.
    #[default]
    Content,
    /// Compare size and modification time.
    Timestamp,
}

impl FingerprintMode {
    /// Parses the lowercase name used in configuration and `KILN_FINGERPRINT_MODE`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "content" | "hash" => Some(FingerprintMode::Content),
            "timestamp" | "mtime" => Some(FingerprintMode::Timestamp),
            _ => None,
        }
    }
}

/// What to do when a consumer imports a module from a target it does not depend on.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MissingDependencyLevel {
    /// Do not diagnose.
    #[default]
    No,
    /// Emit a warning.
    Yes,
    /// Emit an error.
    Error,
}

/// The boundary within which identical module keys share one build.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SharingMode {
    /// Each consumer target builds its own module variants.
    #[default]
    Target,
    /// All targets in the build share module variants.
    Workspace,
}

/// The `[build]` table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSection {
    /// Build root holding intermediates and the build state store.
    pub root: PathBuf,
    /// Worker thread count. Defaults to the number of CPUs.
    pub jobs: Option<usize>,
    /// Fingerprinting fidelity, process-wide.
    pub fingerprint: FingerprintMode,
    /// Where to write the cache metrics report after each build.
    pub metrics_path: Option<PathBuf>,
    /// Diagnose module imports that cross undeclared target dependencies.
    pub diagnose_missing_target_dependencies: MissingDependencyLevel,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("build"),
            jobs: None,
            fingerprint: FingerprintMode::default(),
            metrics_path: None,
            diagnose_missing_target_dependencies: MissingDependencyLevel::default(),
        }
    }
}

/// The `[cache]` table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    /// Consult and populate the compilation cache.
    pub enabled: bool,
    /// Explicit cache root; overrides every derived default.
    pub path: Option<PathBuf>,
    /// Derive the cache root from the build root instead of the process-wide default.
    pub arena_scoped: bool,
    /// Keep the cache directory after the build. `false` discards it.
    pub keep: bool,
    /// Maximum cache size, e.g. `"512M"`. `"0"` disables the limit.
    pub limit_size: Option<String>,
    /// Maximum cache size as a percentage of available disk space.
    pub limit_percent: Option<u8>,
    /// Re-run compilations after a hit and compare outputs.
    pub verify: bool,
    /// Fold the working directory out of cache keys when no argument depends on it.
    pub fold_working_directory: bool,
    /// Emit a note for every cache lookup and prune.
    pub diagnostic_remarks: bool,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            arena_scoped: false,
            keep: true,
            limit_size: None,
            limit_percent: None,
            verify: false,
            fold_working_directory: true,
            diagnostic_remarks: false,
        }
    }
}

/// The `[modules]` table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ModulesSection {
    /// Build discovered modules as separate, deduplicated tasks.
    pub enabled: bool,
    /// Sharing scope for module variants.
    pub sharing: SharingMode,
    /// Directory under the build root for module outputs.
    pub directory: PathBuf,
    /// Directory for the precompiled modules report. No report when unset.
    pub report_dir: Option<PathBuf>,
}

impl Default for ModulesSection {
    fn default() -> Self {
        Self {
            enabled: true,
            sharing: SharingMode::default(),
            directory: PathBuf::from("ExplicitModules"),
            report_dir: None,
        }
    }
}

/// The `[remap]` table.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RemapSection {
    /// Toolchain installation root, rewritten to `/^toolchain`.
    pub toolchain: Option<PathBuf>,
    /// SDK root, rewritten to `/^sdk`.
    pub sdk: Option<PathBuf>,
    /// Workspace source root, rewritten to `/^src`.
    pub workspace: Option<PathBuf>,
}
