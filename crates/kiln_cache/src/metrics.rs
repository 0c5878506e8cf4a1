//! Hit and miss counters, exported as a JSON report after each build.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use kiln_plan::CacheKind;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Per-rule-kind counters. Zero counters are omitted from the report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCacheCounts {
    /// Lookups that found an entry.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_hits: u64,
    /// Lookups that found nothing.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_misses: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// The serialized metrics document.
///
/// ```json
/// {"global":{"compileCacheHits":0,"compileCacheMisses":1,...},"tasks":{"CompileC":{"cacheMisses":1}}}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsReport {
    /// Counters per cache kind, keyed `<kind>CacheHits` / `<kind>CacheMisses`.
    pub global: BTreeMap<String, u64>,
    /// Counters per rule kind.
    pub tasks: BTreeMap<String, TaskCacheCounts>,
}

/// Thread-safe cache metrics for one build.
#[derive(Debug)]
pub struct CacheMetrics {
    report: Mutex<MetricsReport>,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheMetrics {
    /// Creates counters with every global key present and zero.
    pub fn new() -> Self {
        let mut global = BTreeMap::new();
        for kind in CacheKind::ALL {
            global.insert(hits_key(kind), 0);
            global.insert(misses_key(kind), 0);
        }
        Self {
            report: Mutex::new(MetricsReport {
                global,
                tasks: BTreeMap::new(),
            }),
        }
    }

    /// Records one lookup for a task of the given rule kind.
    pub fn record(&self, kind: CacheKind, rule_kind: &str, hit: bool) {
        let mut report = self.report.lock().unwrap_or_else(PoisonError::into_inner);
        let global_key = if hit { hits_key(kind) } else { misses_key(kind) };
        *report.global.entry(global_key).or_default() += 1;
        let counts = report.tasks.entry(rule_kind.to_string()).or_default();
        if hit {
            counts.cache_hits += 1;
        } else {
            counts.cache_misses += 1;
        }
    }

    /// Total hits across all kinds.
    pub fn hits(&self) -> u64 {
        self.total(|c| c.cache_hits)
    }

    /// Total misses across all kinds.
    pub fn misses(&self) -> u64 {
        self.total(|c| c.cache_misses)
    }

    fn total(&self, select: impl Fn(&TaskCacheCounts) -> u64) -> u64 {
        let report = self.report.lock().unwrap_or_else(PoisonError::into_inner);
        report.tasks.values().map(select).sum()
    }

    /// Snapshot of the current counters.
    pub fn report(&self) -> MetricsReport {
        self.report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The end-of-build summary, e.g. `1 hit (50%), 1 miss`.
    ///
    /// `None` when no lookup happened.
    pub fn summary(&self) -> Option<String> {
        let hits = self.hits();
        let misses = self.misses();
        let total = hits + misses;
        if total == 0 {
            return None;
        }
        Some(format!(
            "{hits} {} ({}%), {misses} {}",
            if hits == 1 { "hit" } else { "hits" },
            hits * 100 / total,
            if misses == 1 { "miss" } else { "misses" },
        ))
    }

    /// Writes the report as JSON, creating parent directories as needed.
    pub fn write_report(&self, path: &Path) -> Result<(), CacheError> {
        let json = serde_json::to_string(&self.report()).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        fs::write(path, json).map_err(|e| CacheError::io(path, e))
    }
}

fn hits_key(kind: CacheKind) -> String {
    format!("{}CacheHits", kind.as_str())
}

fn misses_key(kind: CacheKind) -> String {
    format!("{}CacheMisses", kind.as_str())
}
