//! The incremental rebuild decision core.
//!
//! For every task the engine computes a [`Signature`], compares it with the
//! [`TaskRecord`] kept in the [`BuildStateStore`], and decides whether the task
//! must run. Every `MustRun` decision carries a one-hop [`Cause`]; following
//! causes backward through producers yields the task's [`Backtrace`].

#![warn(missing_docs)]

pub mod backtrace;
pub mod decision;
pub mod error;
pub mod signature;
pub mod state;

pub use backtrace::{
    build_backtrace, Backtrace, BacktraceCategory, BacktraceEntry, BacktraceSubject, CauseGraph,
};
pub use decision::{decide, Cause, Decision, DecisionInput, InputChange, InputWriter, OutputCheck};
pub use error::EngineError;
pub use signature::{ComputedSignature, Signature, SignatureComputer};
pub use state::{BuildStateStore, TaskRecord, STATE_FILE_NAME};
