//! Filesystem access and file fingerprinting for the build core.
//!
//! [`FileSystem`] is the boundary to the host filesystem; [`FingerprintStore`]
//! turns paths into [`Fingerprint`]s in either content or timestamp mode and
//! memoizes them for the duration of one build.

#![warn(missing_docs)]

pub mod error;
pub mod fingerprint;
pub mod fs;

pub use error::FsError;
pub use fingerprint::{Fingerprint, FingerprintStore};
pub use fs::{FileStat, FileSystem, LocalFs};
