//! The boundary to whatever actually runs compilers and scanners.

use std::path::{Path, PathBuf};

use kiln_modules::{ScanError, ScanOutput};
use kiln_plan::Task;

/// A request to run one task.
#[derive(Debug, Clone, Copy)]
pub struct ExecRequest<'a> {
    /// The task to run.
    pub task: &'a Task,
    /// Inputs discovered at runtime, such as scanned headers and module outputs.
    pub discovered_inputs: &'a [PathBuf],
}

/// A request to discover the dependencies of one source file.
#[derive(Debug, Clone, Copy)]
pub struct ScanRequest<'a> {
    /// The scan-capable task.
    pub task: &'a Task,
    /// The source file to scan.
    pub source: &'a Path,
}

/// Result of running a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Process exit status. Zero is success.
    pub exit_status: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutcome {
    /// A successful run with no output.
    pub fn success() -> Self {
        Self::default()
    }

    /// A failed run.
    pub fn failure(exit_status: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the process exited with status zero.
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

/// Runs tasks and dependency scans on behalf of the scheduler.
///
/// Called concurrently from worker threads.
pub trait Executor: Send + Sync {
    /// Runs a task to completion. Declared outputs must exist afterwards on success.
    fn execute(&self, request: &ExecRequest<'_>) -> ExecOutcome;

    /// Scans a source file for its file and module dependencies.
    fn scan(&self, request: &ScanRequest<'_>) -> Result<ScanOutput, ScanError> {
        Err(ScanError::Failed {
            task: request.task.description.clone(),
            reason: "executor does not support dependency scanning".to_string(),
        })
    }
}
