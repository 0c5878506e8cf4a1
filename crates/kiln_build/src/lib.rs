//! Build scheduling and the end-to-end build session.
//!
//! A [`BuildSession`] runs a validated [`kiln_plan::BuildPlan`] through an
//! [`Executor`]. Every task is gated by the rebuild decision engine;
//! cacheable tasks consult the compilation cache; scan-capable tasks are
//! scanned first and may insert module build tasks into the graph at
//! runtime. The result is a [`BuildReport`] with per-task outcomes and
//! backtraces, the ordered event log, diagnostics and cache metrics.

#![warn(missing_docs)]

pub mod cancel;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod logging;
pub mod report;
mod scheduler;
pub mod session;

pub use cancel::CancellationToken;
pub use error::{plan_diagnostic, BuildError};
pub use events::{BuildEvent, EventLog};
pub use executor::{ExecOutcome, ExecRequest, Executor, ScanRequest};
pub use graph::{BuildGraph, NodeState};
pub use report::{BuildReport, TaskOutcome, TaskReport};
pub use session::BuildSession;
