//! Error types for dependency scanning.

use kiln_fs::FsError;

/// A dependency scan could not produce a usable result.
///
/// The scanned task and everything depending on it stay blocked.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// A module was imported but nothing defines it.
    #[error("dependency scan of '{task}' failed: module '{module}' could not be found")]
    UnresolvedModule {
        /// The unresolvable module name.
        module: String,
        /// Description of the scanned task.
        task: String,
    },

    /// Module imports form a cycle.
    #[error("dependency scan of '{task}' failed: module '{module}' imports itself through a cycle")]
    ImportCycle {
        /// A module on the cycle.
        module: String,
        /// Description of the scanned task.
        task: String,
    },

    /// The scan step's output could not be parsed.
    #[error("dependency scan of '{task}' produced malformed output: {reason}")]
    MalformedOutput {
        /// Description of the scanned task.
        task: String,
        /// Parser error.
        reason: String,
    },

    /// The scan step itself failed.
    #[error("dependency scan of '{task}' failed: {reason}")]
    Failed {
        /// Description of the scanned task.
        task: String,
        /// What went wrong.
        reason: String,
    },

    /// A discovered input could not be fingerprinted.
    #[error("dependency scan of '{task}' could not read a discovered input: {source}")]
    Input {
        /// Description of the scanned task.
        task: String,
        /// The filesystem error.
        source: FsError,
    },
}

impl ScanError {
    /// The scanned task's description.
    pub fn task(&self) -> &str {
        match self {
            ScanError::UnresolvedModule { task, .. }
            | ScanError::ImportCycle { task, .. }
            | ScanError::MalformedOutput { task, .. }
            | ScanError::Failed { task, .. }
            | ScanError::Input { task, .. } => task,
        }
    }
}
