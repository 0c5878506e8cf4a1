//! Content-addressed compilation cache.
//!
//! A [`CompilationCache`] maps a canonicalized [`CacheKey`] to the outputs and
//! diagnostics a compilation produced. Keys are computed by a
//! [`KeyCanonicalizer`] that rewrites environment-specific path prefixes to
//! placeholders, so identical compilations in different trees share entries.
//! The store is safe to share between concurrent build processes: writes are
//! idempotent per key and pruning skips entries that other processes hold.

#![warn(missing_docs)]

pub mod entry;
pub mod error;
pub mod key;
pub mod metrics;
pub mod remap;
pub mod store;
pub mod verify;

pub use entry::{CacheEntry, OutputBlob};
pub use error::CacheError;
pub use key::{CacheKey, KeyCanonicalizer, KeyMaterial};
pub use metrics::{CacheMetrics, MetricsReport, TaskCacheCounts};
pub use remap::PathRemapper;
pub use store::{CompilationCache, Lookup, PruneSummary, StoreOutcome};
pub use verify::verify_outputs;
