//! Error types for filesystem access and fingerprinting.

use std::path::PathBuf;

/// Errors raised while reading or fingerprinting files.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// An I/O error occurred on the given path.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl FsError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FsError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns the path the error occurred on.
    pub fn path(&self) -> &std::path::Path {
        match self {
            FsError::Io { path, .. } => path,
        }
    }
}
