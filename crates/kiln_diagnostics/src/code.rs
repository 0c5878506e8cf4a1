//! Diagnostic codes with category prefixes.
//!
//! Numbers are grouped by subsystem: `1xx` plan, `2xx` scanning and modules,
//! `3xx` compilation cache, `4xx` task execution and state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The category of a diagnostic code, determining its prefix letter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Category {
    /// Error diagnostics, prefixed with `E`.
    Error,
    /// Warning diagnostics, prefixed with `W`.
    Warning,
    /// Informational remarks, prefixed with `N`.
    Note,
}

impl Category {
    /// Returns the single-character prefix for this category.
    pub fn prefix(self) -> char {
        match self {
            Category::Error => 'E',
            Category::Warning => 'W',
            Category::Note => 'N',
        }
    }
}

/// A diagnostic code such as `E201` or `N301`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct DiagnosticCode {
    /// The category of this diagnostic.
    pub category: Category,
    /// The numeric identifier within the category.
    pub number: u16,
}

impl DiagnosticCode {
    /// Creates a new diagnostic code.
    pub const fn new(category: Category, number: u16) -> Self {
        Self { category, number }
    }

    /// Two tasks declare the same output path.
    pub const DUPLICATE_OUTPUT: Self = Self::new(Category::Error, 101);
    /// The static plan contains a dependency cycle.
    pub const DEPENDENCY_CYCLE: Self = Self::new(Category::Error, 102);
    /// A task in the plan is malformed.
    pub const INVALID_TASK: Self = Self::new(Category::Error, 103);
    /// A dependency scan failed.
    pub const SCAN_FAILED: Self = Self::new(Category::Error, 201);
    /// A target imports a module from a target it does not depend on (error level).
    pub const MISSING_TARGET_DEPENDENCY_ERROR: Self = Self::new(Category::Error, 202);
    /// A target imports a module from a target it does not depend on.
    pub const MISSING_TARGET_DEPENDENCY: Self = Self::new(Category::Warning, 201);
    /// Cached outputs differ from a verification run.
    pub const CACHE_INTEGRITY: Self = Self::new(Category::Error, 301);
    /// The compilation cache could not be used; falling back to recomputation.
    pub const CACHE_UNAVAILABLE: Self = Self::new(Category::Warning, 301);
    /// Pruning could not bring the cache under its size limit.
    pub const CACHE_OVER_LIMIT: Self = Self::new(Category::Warning, 302);
    /// A cache hit could not be checked against a verification run.
    pub const CACHE_NOT_VERIFIED: Self = Self::new(Category::Warning, 303);
    /// Per-lookup cache remark.
    pub const CACHE_REMARK: Self = Self::new(Category::Note, 301);
    /// End-of-build cache hit/miss summary.
    pub const CACHE_SUMMARY: Self = Self::new(Category::Note, 302);
    /// Pruning remark.
    pub const CACHE_PRUNE: Self = Self::new(Category::Note, 303);
    /// A task's signature could not be computed.
    pub const SIGNATURE_FAILED: Self = Self::new(Category::Error, 401);
    /// A task's command failed.
    pub const TASK_FAILED: Self = Self::new(Category::Error, 402);
    /// The build state store could not be read or written.
    pub const STATE_STORE: Self = Self::new(Category::Warning, 401);
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:03}", self.category.prefix(), self.number)
    }
}
