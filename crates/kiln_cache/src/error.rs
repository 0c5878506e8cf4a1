//! Compilation cache failures.

use std::path::PathBuf;

/// A compilation cache failure.
///
/// A corrupt or unreadable entry found by a lookup is a miss, never one of
/// these. They surface from opening the root, storing, pruning and verifying.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Reading or writing a file under the cache root failed.
    #[error("compilation cache I/O error at {}: {source}", .path.display())]
    Io {
        /// Entry, lock or instance file involved.
        path: PathBuf,
        /// What the OS reported.
        source: std::io::Error,
    },

    /// An entry file does not start with a kiln entry header.
    #[error("{} is not a cache entry: {reason}", .path.display())]
    InvalidHeader {
        /// Entry file.
        path: PathBuf,
        /// What is wrong with the header.
        reason: String,
    },

    /// The entry payload was truncated or overwritten.
    #[error("cache entry {} is damaged: checksum {actual} does not match recorded {expected}", .path.display())]
    ChecksumMismatch {
        /// Entry file.
        path: PathBuf,
        /// Checksum recorded in the header.
        expected: String,
        /// Checksum of the payload as read.
        actual: String,
    },

    /// The entry was written by a different entry format.
    #[error("cache entry {} has format {actual}, this build reads format {expected}", .path.display())]
    VersionMismatch {
        /// Entry file.
        path: PathBuf,
        /// Format this build reads.
        expected: u32,
        /// Format found in the file.
        actual: u32,
    },

    /// An entry could not be encoded or decoded.
    #[error("cache entry encoding failed: {reason}")]
    Serialization {
        /// The codec's message.
        reason: String,
    },

    /// Verification found cached outputs that differ from a fresh run.
    #[error("cache integrity error for key {key} in '{task}': {detail}")]
    Integrity {
        /// The cache key whose entry is wrong.
        key: String,
        /// Description of the task that was verified.
        task: String,
        /// Which output differed and how.
        detail: String,
    },

    /// The cache root could not be used. Callers treat this as all-misses.
    #[error("compilation cache at {root} is unavailable: {reason}")]
    Unavailable {
        /// The cache root.
        root: PathBuf,
        /// Why it could not be used.
        reason: String,
    },
}

impl CacheError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_the_entry() {
        let err = CacheError::io(
            "/cas/compile/objects/ab/abcd.entry",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(
            err.to_string(),
            "compilation cache I/O error at /cas/compile/objects/ab/abcd.entry: denied"
        );
    }

    #[test]
    fn damaged_entry_display() {
        let err = CacheError::ChecksumMismatch {
            path: PathBuf::from("x.entry"),
            expected: "aabb".to_string(),
            actual: "ccdd".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "cache entry x.entry is damaged: checksum ccdd does not match recorded aabb"
        );
    }

    #[test]
    fn foreign_format_display() {
        let err = CacheError::VersionMismatch {
            path: PathBuf::from("old.entry"),
            expected: 2,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "cache entry old.entry has format 1, this build reads format 2"
        );
    }

    #[test]
    fn integrity_display_names_task_and_key() {
        let err = CacheError::Integrity {
            key: "0123".to_string(),
            task: "Compile foo.c".to_string(),
            detail: "output '/^build/foo.o' differs".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "cache integrity error for key 0123 in 'Compile foo.c': output '/^build/foo.o' differs"
        );
    }

    #[test]
    fn unavailable_display() {
        let err = CacheError::Unavailable {
            root: PathBuf::from("/cas"),
            reason: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "compilation cache at /cas is unavailable: permission denied"
        );
    }
}
