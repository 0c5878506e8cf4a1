//! Task signatures.
//!
//! A signature has two halves. The command half covers everything the plan
//! declares about how a task runs; the inputs half covers the current state of
//! its inputs. The decision engine compares them separately so that a command
//! change and an input change produce different backtraces.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::{ContentHash, StableHasher};
use kiln_fs::{Fingerprint, FingerprintStore};
use kiln_plan::Task;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// The two halves of a task signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    /// Hash over rule info, command, environment subset and working directory.
    pub command: ContentHash,
    /// Hash over the sorted input fingerprints.
    pub inputs: ContentHash,
}

impl Signature {
    /// Computes a signature from a task and its input fingerprints.
    pub fn of(task: &Task, inputs: &[(PathBuf, Fingerprint)]) -> Self {
        Self {
            command: Self::command_half(task),
            inputs: Self::inputs_half(inputs),
        }
    }

    /// Hash of the declared command. Independent of the filesystem.
    pub fn command_half(task: &Task) -> ContentHash {
        let mut hasher = StableHasher::new("kiln.signature.command.v1");
        hasher
            .write_strs(task.rule_info.parts())
            .write_strs(&task.command);
        hasher.write_u64(task.environment.len() as u64);
        for (name, value) in &task.environment {
            hasher.write_str(name).write_str(value);
        }
        hasher.write_path(&task.working_directory);
        hasher.finish()
    }

    /// Hash of input fingerprints. The order of `inputs` does not matter.
    pub fn inputs_half(inputs: &[(PathBuf, Fingerprint)]) -> ContentHash {
        let mut sorted: Vec<&(PathBuf, Fingerprint)> = inputs.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut hasher = StableHasher::new("kiln.signature.inputs.v1");
        hasher.write_u64(sorted.len() as u64);
        for (path, fingerprint) in sorted {
            hasher.write_path(path);
            fingerprint.hash_into(&mut hasher);
        }
        hasher.finish()
    }

    /// Both halves folded into one hash.
    pub fn combined(&self) -> ContentHash {
        StableHasher::new("kiln.signature.v1")
            .write_hash(&self.command)
            .write_hash(&self.inputs)
            .finish()
    }
}

/// A signature together with the fingerprints it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedSignature {
    /// The signature.
    pub signature: Signature,
    /// Input fingerprints, sorted by path.
    pub inputs: Vec<(PathBuf, Fingerprint)>,
}

/// Computes signatures against the build's fingerprint store.
pub struct SignatureComputer {
    fingerprints: Arc<FingerprintStore>,
}

impl SignatureComputer {
    /// Creates a computer sharing the given store.
    pub fn new(fingerprints: Arc<FingerprintStore>) -> Self {
        Self { fingerprints }
    }

    /// The underlying fingerprint store.
    pub fn fingerprints(&self) -> &Arc<FingerprintStore> {
        &self.fingerprints
    }

    /// Computes the signature of `task`.
    ///
    /// `discovered` adds inputs found at runtime, such as scanned headers and
    /// module outputs. A missing input that no task produces is an error.
    pub fn compute(
        &self,
        task: &Task,
        discovered: &[PathBuf],
        is_produced: &dyn Fn(&Path) -> bool,
    ) -> Result<ComputedSignature, EngineError> {
        let mut paths: Vec<PathBuf> = task.inputs.iter().chain(discovered).cloned().collect();
        paths.sort();
        paths.dedup();
        let inputs = self.fingerprints.fingerprint_all(&paths)?;
        if let Some((path, _)) = inputs
            .iter()
            .find(|(path, fingerprint)| fingerprint.is_missing() && !is_produced(path.as_path()))
        {
            return Err(EngineError::SignatureComputation {
                task: task.description.clone(),
                reason: format!(
                    "input '{}' does not exist and no task produces it",
                    path.display()
                ),
            });
        }
        Ok(ComputedSignature {
            signature: Signature::of(task, &inputs),
            inputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_config::FingerprintMode;
    use kiln_fs::LocalFs;
    use std::fs;

    fn computer() -> SignatureComputer {
        let store = FingerprintStore::new(Arc::new(LocalFs), FingerprintMode::Content);
        SignatureComputer::new(Arc::new(store))
    }

    fn compile(dir: &Path) -> Task {
        Task::new(["CompileC", "foo.o"], vec!["cc".to_string(), "-c".to_string()])
            .with_inputs([dir.join("foo.c"), dir.join("foo.h")])
            .with_env("LANG", "C")
    }

    #[test]
    fn reproducible_and_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("foo.c"), "int x;").unwrap();
        fs::write(dir.path().join("foo.h"), "extern int x;").unwrap();
        let a = computer().compute(&compile(dir.path()), &[], &|_| false).unwrap();
        let mut reversed = compile(dir.path());
        reversed.inputs.reverse();
        let b = computer().compute(&reversed, &[], &|_| false).unwrap();
        assert_eq!(a.signature, b.signature);
        assert_eq!(a.signature.combined(), b.signature.combined());
    }

    #[test]
    fn halves_change_independently() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("foo.c"), "int x;").unwrap();
        fs::write(dir.path().join("foo.h"), "extern int x;").unwrap();
        let base = computer().compute(&compile(dir.path()), &[], &|_| false).unwrap();

        let flagged = compile(dir.path()).with_env("LANG", "en_US");
        let changed = computer().compute(&flagged, &[], &|_| false).unwrap();
        assert_ne!(base.signature.command, changed.signature.command);
        assert_eq!(base.signature.inputs, changed.signature.inputs);

        fs::write(dir.path().join("foo.h"), "extern long x;").unwrap();
        let edited = computer().compute(&compile(dir.path()), &[], &|_| false).unwrap();
        assert_eq!(base.signature.command, edited.signature.command);
        assert_ne!(base.signature.inputs, edited.signature.inputs);
    }

    #[test]
    fn discovered_inputs_are_included() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("foo.c"), "int x;").unwrap();
        fs::write(dir.path().join("foo.h"), "").unwrap();
        fs::write(dir.path().join("bar.h"), "").unwrap();
        let computed = computer()
            .compute(&compile(dir.path()), &[dir.path().join("bar.h")], &|_| false)
            .unwrap();
        assert_eq!(computed.inputs.len(), 3);
        assert!(computed.inputs.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn missing_unproduced_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("foo.c"), "int x;").unwrap();
        let err = computer()
            .compute(&compile(dir.path()), &[], &|_| false)
            .unwrap_err();
        assert!(matches!(err, EngineError::SignatureComputation { .. }));
        assert!(err.to_string().contains("foo.h"));

        let produced = dir.path().join("foo.h");
        let ok = computer().compute(&compile(dir.path()), &[], &|p| p == produced);
        assert!(ok.is_ok());
    }
}
