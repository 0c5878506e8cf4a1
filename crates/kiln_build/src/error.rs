//! Errors that abort a build before or after task execution.
//!
//! Per-task failures are not errors at this level; they are reported as
//! diagnostics and task outcomes in the build report.

use std::path::PathBuf;

use kiln_cache::CacheError;
use kiln_config::ConfigError;
use kiln_diagnostics::{Diagnostic, DiagnosticCode};
use kiln_engine::EngineError;
use kiln_fs::FsError;
use kiln_plan::PlanError;

/// A build that could not run to completion.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The plan is invalid.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// The build state store could not be opened or written.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A configuration value could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Writing a build artifact such as the metrics report failed.
    #[error("failed to write {}: {reason}", .path.display())]
    Report {
        /// Report path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The worker pool could not be created.
    #[error("failed to start worker pool: {reason}")]
    WorkerPool {
        /// Underlying error text.
        reason: String,
    },
}

impl BuildError {
    pub(crate) fn report(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        BuildError::Report {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

/// Converts a rejected plan into the diagnostic shown to the user.
pub fn plan_diagnostic(err: &PlanError) -> Diagnostic {
    let code = match err {
        PlanError::DuplicateOutput { .. } => DiagnosticCode::DUPLICATE_OUTPUT,
        PlanError::DependencyCycle { .. } => DiagnosticCode::DEPENDENCY_CYCLE,
        PlanError::InvalidTask { .. } => DiagnosticCode::INVALID_TASK,
    };
    let diag = Diagnostic::error(code, err.to_string());
    match err {
        PlanError::DuplicateOutput { second, .. } => diag
            .with_subject(second.clone())
            .with_help("only tasks that mutate a path in place may share it as an output"),
        PlanError::DependencyCycle { task } => diag.with_subject(task.clone()),
        PlanError::InvalidTask { .. } => diag,
    }
}

impl From<CacheError> for BuildError {
    fn from(err: CacheError) -> Self {
        let path = match &err {
            CacheError::Io { path, .. } => path.clone(),
            _ => PathBuf::new(),
        };
        BuildError::report(path, err)
    }
}

impl From<FsError> for BuildError {
    fn from(err: FsError) -> Self {
        BuildError::Engine(EngineError::Fs(err))
    }
}
