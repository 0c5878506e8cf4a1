//! Plan-time errors. Any of these aborts the whole build.

use std::path::PathBuf;

/// Errors detected while validating a build plan.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// Two tasks declare the same output without arbitration.
    #[error("multiple tasks produce '{}': '{first}' and '{second}'", .path.display())]
    DuplicateOutput {
        /// The contested output path.
        path: PathBuf,
        /// Description of the first producer in plan order.
        first: String,
        /// Description of the second producer in plan order.
        second: String,
    },

    /// The static dependency edges form a cycle.
    #[error("dependency cycle involving '{task}'")]
    DependencyCycle {
        /// Description of a task on the cycle.
        task: String,
    },

    /// A task is malformed.
    #[error("invalid task #{index}: {reason}")]
    InvalidTask {
        /// Position of the task in the plan.
        index: usize,
        /// What is wrong with it.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_output_names_both_producers() {
        let err = PlanError::DuplicateOutput {
            path: PathBuf::from("/out/foo.o"),
            first: "Compile foo.c".to_string(),
            second: "Compile foo.m".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "multiple tasks produce '/out/foo.o': 'Compile foo.c' and 'Compile foo.m'"
        );
    }

    #[test]
    fn cycle_display() {
        let err = PlanError::DependencyCycle {
            task: "Link app".to_string(),
        };
        assert_eq!(err.to_string(), "dependency cycle involving 'Link app'");
    }
}
