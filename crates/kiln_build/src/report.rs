//! What a finished build hands back to its caller.

use kiln_cache::{MetricsReport, PruneSummary};
use kiln_diagnostics::{Diagnostic, Severity};
use kiln_engine::Backtrace;
use kiln_modules::RetiredVariant;
use kiln_plan::RuleInfo;

use crate::events::BuildEvent;

/// How one task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The executor ran the task.
    Executed,
    /// The outputs were restored from the compilation cache.
    Restored,
    /// The recorded results were current.
    UpToDate,
    /// The task or its scan failed.
    Failed,
    /// A dependency failed.
    Blocked,
    /// The build was cancelled first.
    Cancelled,
}

impl TaskOutcome {
    /// Whether the task produced its outputs in this build.
    pub fn ran(self) -> bool {
        matches!(self, TaskOutcome::Executed | TaskOutcome::Restored)
    }

    /// Whether the task ended without error.
    pub fn succeeded(self) -> bool {
        matches!(
            self,
            TaskOutcome::Executed | TaskOutcome::Restored | TaskOutcome::UpToDate
        )
    }
}

/// Result of one task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Identity of the task.
    pub rule_info: RuleInfo,
    /// Execution description.
    pub description: String,
    /// How it ended.
    pub outcome: TaskOutcome,
    /// Why it ran. Empty when it did not.
    pub backtrace: Backtrace,
    /// Whether a dependency scan inserted the task.
    pub dynamic: bool,
}

/// Result of a whole build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// Every task in the build graph, planned tasks first.
    pub tasks: Vec<TaskReport>,
    /// What happened, in order.
    pub events: Vec<BuildEvent>,
    /// Diagnostics emitted during the build.
    pub diagnostics: Vec<Diagnostic>,
    /// Compilation cache counters.
    pub metrics: MetricsReport,
    /// The cache prune pass, if one ran.
    pub prune: Option<PruneSummary>,
    /// Module variants retired at the end of the build.
    pub retired_variants: Vec<RetiredVariant>,
    /// Whether the build was cancelled.
    pub cancelled: bool,
}

impl BuildReport {
    /// Looks up a task by description.
    pub fn task(&self, description: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|task| task.description == description)
    }

    /// The outcome of a task, by description.
    pub fn outcome(&self, description: &str) -> Option<TaskOutcome> {
        self.task(description).map(|task| task.outcome)
    }

    /// The backtrace of a task, by description.
    pub fn backtrace(&self, description: &str) -> Option<&Backtrace> {
        self.task(description).map(|task| &task.backtrace)
    }

    /// Descriptions of tasks that produced outputs in this build.
    pub fn ran(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|task| task.outcome.ran())
            .map(|task| task.description.as_str())
            .collect()
    }

    /// Tasks with the given outcome.
    pub fn with_outcome(&self, outcome: TaskOutcome) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(move |task| task.outcome == outcome)
    }

    /// Error diagnostics.
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|diag| diag.severity == Severity::Error)
    }

    /// Whether every task succeeded and no error was diagnosed.
    pub fn succeeded(&self) -> bool {
        !self.cancelled
            && self.tasks.iter().all(|task| task.outcome.succeeded())
            && self.errors().next().is_none()
    }
}
