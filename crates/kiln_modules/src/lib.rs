//! Dependency scanning and deduplicated module builds.
//!
//! The [`DependencyScanner`] turns a scan step's JSON output into the set of
//! [`ModuleKey`]s a compilation needs, and decides when a previous scan can be
//! reused. The [`ModuleCoordinator`] maps each `(scope, key)` pair to exactly
//! one build task and tracks module variants across builds so that stale ones
//! are retired.

#![warn(missing_docs)]

pub mod coordinator;
pub mod error;
pub mod key;
pub mod output;
pub mod report;
pub mod scanner;
pub mod variants;

pub use coordinator::{missing_dependency_diagnostic, ModuleCoordinator, SharingScope};
pub use error::ScanError;
pub use key::{resolve_modules, ModuleKey, ResolvedModule};
pub use output::{ModuleDecl, ScanOutput};
pub use report::ModuleReport;
pub use scanner::{DependencyScanner, ScanRecord};
pub use variants::{RetiredVariant, VariantRecord, VariantState, VariantTable};
