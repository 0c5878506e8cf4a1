//! Verification of cached outputs against a fresh run.

use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::key::CacheKey;

/// Compares the outputs of a cache hit with the outputs of re-running the task.
///
/// Diagnostics are not compared; only output names and bytes are.
pub fn verify_outputs(
    key: &CacheKey,
    task: &str,
    cached: &CacheEntry,
    fresh: &CacheEntry,
) -> Result<(), CacheError> {
    let integrity = |detail: String| CacheError::Integrity {
        key: key.to_string(),
        task: task.to_string(),
        detail,
    };
    for output in &fresh.outputs {
        match cached.output(&output.name) {
            None => {
                return Err(integrity(format!(
                    "output '{}' is missing from the cached entry",
                    output.name
                )))
            }
            Some(blob) if blob.data != output.data => {
                return Err(integrity(format!(
                    "output '{}' differs ({} cached bytes, {} fresh bytes)",
                    output.name,
                    blob.data.len(),
                    output.data.len()
                )))
            }
            Some(_) => {}
        }
    }
    if let Some(extra) = cached
        .outputs
        .iter()
        .find(|blob| fresh.output(&blob.name).is_none())
    {
        return Err(integrity(format!(
            "cached output '{}' was not produced by the fresh run",
            extra.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::OutputBlob;
    use kiln_common::ContentHash;

    fn entry(outputs: &[(&str, &[u8])]) -> CacheEntry {
        CacheEntry {
            outputs: outputs
                .iter()
                .map(|(name, data)| OutputBlob {
                    name: name.to_string(),
                    data: data.to_vec(),
                })
                .collect(),
            diagnostics: Vec::new(),
        }
    }

    fn key() -> CacheKey {
        CacheKey::from_hash(ContentHash::from_bytes(b"k"))
    }

    #[test]
    fn identical_outputs_pass() {
        let e = entry(&[("/^build/a.o", b"A")]);
        assert!(verify_outputs(&key(), "Compile a.c", &e, &e.clone()).is_ok());
    }

    #[test]
    fn differing_bytes_fail() {
        let cached = entry(&[("/^build/a.o", b"A")]);
        let fresh = entry(&[("/^build/a.o", b"B")]);
        let err = verify_outputs(&key(), "Compile a.c", &cached, &fresh).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Compile a.c"));
        assert!(msg.contains("'/^build/a.o' differs"));
    }

    #[test]
    fn missing_or_extra_outputs_fail() {
        let one = entry(&[("/^build/a.o", b"A")]);
        let two = entry(&[("/^build/a.o", b"A"), ("/^build/a.d", b"dep")]);
        assert!(matches!(
            verify_outputs(&key(), "t", &one, &two),
            Err(CacheError::Integrity { .. })
        ));
        assert!(matches!(
            verify_outputs(&key(), "t", &two, &one),
            Err(CacheError::Integrity { .. })
        ));
    }
}
