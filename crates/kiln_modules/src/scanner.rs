//! Scan results and the rules for reusing them across builds.

use std::path::PathBuf;
use std::sync::Arc;

use kiln_cache::PathRemapper;
use kiln_common::{ContentHash, StableHasher};
use kiln_fs::{Fingerprint, FingerprintStore};
use kiln_plan::Task;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ScanError;
use crate::key::{resolve_modules, ModuleKey, ResolvedModule};
use crate::output::ScanOutput;

/// The persisted outcome of one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Command half of the scanned task's signature at scan time.
    pub command: ContentHash,
    /// Fingerprints of the source, its file dependencies and module-defining inputs.
    pub inputs: Vec<(PathBuf, Fingerprint)>,
    /// The raw scan output.
    pub output: ScanOutput,
    /// Required modules in dependency order.
    pub modules: Vec<ResolvedModule>,
    /// Hash folded into the scanned task's cache key.
    pub contribution: ContentHash,
}

impl ScanRecord {
    /// Keys of every module the scanned task requires.
    pub fn module_keys(&self) -> impl Iterator<Item = &ModuleKey> {
        self.modules.iter().map(|m| &m.key)
    }

    /// Discovered non-module file dependencies.
    pub fn file_dependencies(&self) -> &[PathBuf] {
        &self.output.file_dependencies
    }
}

/// Resolves scan outputs and decides when a previous scan still holds.
pub struct DependencyScanner {
    fingerprints: Arc<FingerprintStore>,
    remapper: PathRemapper,
}

impl DependencyScanner {
    /// Creates a scanner sharing the build's fingerprint store.
    pub fn new(fingerprints: Arc<FingerprintStore>, remapper: PathRemapper) -> Self {
        Self {
            fingerprints,
            remapper,
        }
    }

    /// Returns `true` if `previous` can stand in for a fresh scan.
    ///
    /// That requires an unchanged command half, unchanged fingerprints for
    /// every recorded input, and a compilation cache that survived since the
    /// previous build.
    pub fn can_reuse(
        &self,
        previous: Option<&ScanRecord>,
        command: ContentHash,
        cache_lost: bool,
    ) -> bool {
        let Some(previous) = previous else {
            return false;
        };
        if cache_lost || previous.command != command {
            return false;
        }
        previous.inputs.iter().all(|(path, recorded)| {
            match self.fingerprints.fingerprint(path) {
                Ok(current) => current == *recorded,
                Err(err) => {
                    debug!(path = %path.display(), %err, "scan input unreadable, rescanning");
                    false
                }
            }
        })
    }

    /// Turns a fresh scan output into a record.
    pub fn resolve(
        &self,
        task: &Task,
        command: ContentHash,
        output: ScanOutput,
    ) -> Result<ScanRecord, ScanError> {
        let description = task.description.as_str();
        let input_error = |source| ScanError::Input {
            task: description.to_string(),
            source,
        };
        let modules = resolve_modules(
            description,
            &output,
            &|path| self.fingerprints.content_hash(path),
            &self.remapper,
        )?;

        let mut tracked: Vec<PathBuf> = Vec::new();
        if let Some(spec) = task.scan_spec() {
            tracked.push(spec.source.clone());
        }
        tracked.extend(output.file_dependencies.iter().cloned());
        for module in &modules {
            tracked.extend(module.decl.defining_inputs.iter().cloned());
        }
        tracked.sort();
        tracked.dedup();
        let inputs = self.fingerprints.fingerprint_all(&tracked).map_err(input_error)?;

        let mut hasher = StableHasher::new("kiln.scan-contribution.v1");
        let mut files = output.file_dependencies.clone();
        files.sort();
        files.dedup();
        hasher.write_u64(files.len() as u64);
        for path in &files {
            let hash = self.fingerprints.content_hash(path).map_err(input_error)?;
            hasher
                .write_path(&self.remapper.remap_path(path))
                .write_hash(&hash);
        }
        let mut keys: Vec<&ModuleKey> = modules.iter().map(|m| &m.key).collect();
        keys.sort();
        hasher.write_u64(keys.len() as u64);
        for key in keys {
            hasher.write_str(&key.name).write_hash(&key.hash);
        }

        debug!(
            task = description,
            modules = modules.len(),
            files = files.len(),
            "resolved dependency scan"
        );
        Ok(ScanRecord {
            command,
            inputs,
            contribution: hasher.finish(),
            output,
            modules,
        })
    }
}
