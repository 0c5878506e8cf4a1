//! The static build plan handed to the core by the project layer.
//!
//! A [`BuildPlan`] owns the immutable [`Task`] list, resolves producer and
//! consumer edges from declared inputs and outputs, serializes mutators of
//! overlapping subtrees, and rejects duplicate outputs and cycles before any
//! task runs.

#![warn(missing_docs)]

pub mod error;
pub mod plan;
pub mod task;

pub use error::PlanError;
pub use plan::{BuildPlan, TargetInfo, Writer};
pub use task::{CacheKind, Capabilities, RuleInfo, ScanSpec, Task};
