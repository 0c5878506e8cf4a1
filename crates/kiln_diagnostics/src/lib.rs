//! Structured diagnostics reported by the build core.
//!
//! Scan failures, cache remarks, integrity errors and missing-dependency
//! findings are all surfaced as [`Diagnostic`] values collected in a shared
//! [`DiagnosticSink`], so callers can render or assert on them after a build.

#![warn(missing_docs)]

pub mod code;
pub mod diagnostic;
pub mod severity;
pub mod sink;

pub use code::{Category, DiagnosticCode};
pub use diagnostic::Diagnostic;
pub use severity::Severity;
pub use sink::DiagnosticSink;
