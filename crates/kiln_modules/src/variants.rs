//! Module variants known across builds, and their retirement.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use kiln_fs::{FileSystem, FsError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::key::ModuleKey;

/// Lifecycle of one module variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariantState {
    /// Discovered but not yet built.
    Unbuilt,
    /// A build task for the variant is running.
    Building,
    /// The variant's output is up to date.
    Built,
    /// No consumer references the variant any more.
    Stale,
}

/// What the table remembers about a variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRecord {
    /// Current state.
    pub state: VariantState,
    /// Path of the precompiled module.
    pub output: PathBuf,
}

/// A variant removed by [`VariantTable::retire_unreferenced`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredVariant {
    /// Sharing scope the variant lived in.
    pub scope: String,
    /// The variant's key.
    pub key: ModuleKey,
    /// The deleted output.
    pub output: PathBuf,
}

/// All module variants, keyed by sharing scope and module key.
///
/// Persisted in the build state store so that stale variants from earlier
/// builds can be found and retired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantTable {
    variants: BTreeMap<(String, ModuleKey), VariantRecord>,
}

impl VariantTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a variant as unbuilt unless it is already known.
    pub fn register(&mut self, scope: &str, key: &ModuleKey, output: PathBuf) -> VariantState {
        self.variants
            .entry((scope.to_string(), key.clone()))
            .or_insert(VariantRecord {
                state: VariantState::Unbuilt,
                output,
            })
            .state
    }

    /// Returns a variant's state.
    pub fn state(&self, scope: &str, key: &ModuleKey) -> Option<VariantState> {
        self.get(scope, key).map(|r| r.state)
    }

    /// Returns a variant's record.
    pub fn get(&self, scope: &str, key: &ModuleKey) -> Option<&VariantRecord> {
        self.variants.get(&(scope.to_string(), key.clone()))
    }

    /// Marks a variant as being built.
    pub fn mark_building(&mut self, scope: &str, key: &ModuleKey) {
        self.set(scope, key, VariantState::Building);
    }

    /// Marks a variant as built.
    pub fn mark_built(&mut self, scope: &str, key: &ModuleKey) {
        self.set(scope, key, VariantState::Built);
    }

    /// Returns a variant whose build failed or was cancelled to `Unbuilt`.
    pub fn mark_failed(&mut self, scope: &str, key: &ModuleKey) {
        self.set(scope, key, VariantState::Unbuilt);
    }

    fn set(&mut self, scope: &str, key: &ModuleKey, state: VariantState) {
        if let Some(record) = self.variants.get_mut(&(scope.to_string(), key.clone())) {
            debug!(%scope, module = %key, from = ?record.state, to = ?state, "module variant state");
            record.state = state;
        }
    }

    /// Number of known variants.
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    /// Returns `true` if no variant is known.
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Iterates over `(scope, key, record)` in scope then key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModuleKey, &VariantRecord)> {
        self.variants
            .iter()
            .map(|((scope, key), record)| (scope.as_str(), key, record))
    }

    /// Retires every variant that no consumer references.
    ///
    /// Unreferenced variants become `Stale`; stale variants that are not
    /// mid-build are then dropped and their outputs deleted.
    pub fn retire_unreferenced(
        &mut self,
        referenced: &HashSet<(String, ModuleKey)>,
        fs: &dyn FileSystem,
    ) -> Result<Vec<RetiredVariant>, FsError> {
        for (id, record) in self.variants.iter_mut() {
            if !referenced.contains(id) && record.state != VariantState::Building {
                record.state = VariantState::Stale;
            }
        }

        let stale: Vec<(String, ModuleKey)> = self
            .variants
            .iter()
            .filter(|(_, record)| record.state == VariantState::Stale)
            .map(|(id, _)| id.clone())
            .collect();
        let mut retired = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(record) = self.variants.remove(&id) else {
                continue;
            };
            fs.remove(&record.output)
                .map_err(|e| FsError::io(&record.output, e))?;
            debug!(scope = %id.0, module = %id.1, "retired module variant");
            retired.push(RetiredVariant {
                scope: id.0,
                key: id.1,
                output: record.output,
            });
        }
        Ok(retired)
    }
}
