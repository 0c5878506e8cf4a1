//! Error types for the decision engine and build state store.

use std::path::PathBuf;

use kiln_fs::FsError;

/// Errors raised by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Another build holds the build root.
    #[error("build root {root} is in use by another build")]
    Locked {
        /// The locked build root.
        root: PathBuf,
    },

    /// An I/O error on engine-owned files.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The build state could not be encoded.
    #[error("could not serialize build state: {reason}")]
    Serialization {
        /// Encoder error.
        reason: String,
    },

    /// A task's signature could not be computed; the task fails.
    #[error("could not compute signature of '{task}': {reason}")]
    SignatureComputation {
        /// Description of the task.
        task: String,
        /// What was wrong.
        reason: String,
    },

    /// Fingerprinting failed.
    #[error(transparent)]
    Fs(#[from] FsError),
}

impl EngineError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_names_root() {
        let err = EngineError::Locked {
            root: PathBuf::from("/w/build"),
        };
        assert_eq!(err.to_string(), "build root /w/build is in use by another build");
    }

    #[test]
    fn signature_failure_names_task() {
        let err = EngineError::SignatureComputation {
            task: "Link App".to_string(),
            reason: "input '/w/a.o' does not exist".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "could not compute signature of 'Link App': input '/w/a.o' does not exist"
        );
    }
}
