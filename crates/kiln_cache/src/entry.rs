//! On-disk format of cache entries.
//!
//! Each entry file is `[u32 LE header length][bincode header][bincode payload]`.
//! The header carries magic bytes, a format version, and a checksum of the
//! payload so truncated or tampered entries are detected before use.

use std::path::Path;

use kiln_common::ContentHash;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Magic bytes identifying a Kiln cache entry.
const ENTRY_MAGIC: [u8; 4] = *b"KILN";

/// Current entry format version. Increment on breaking payload changes.
pub(crate) const ENTRY_FORMAT_VERSION: u32 = 1;

/// Header prepended to every entry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EntryHeader {
    /// Magic bytes: must be `b"KILN"`.
    pub magic: [u8; 4],
    /// Entry format version.
    pub format_version: u32,
    /// Hash of the payload bytes.
    pub checksum: ContentHash,
}

/// One output file captured in an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBlob {
    /// Canonicalized output path (placeholders substituted).
    pub name: String,
    /// File contents.
    pub data: Vec<u8>,
}

/// The cached result of one compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Output files in the producing task's declared order.
    pub outputs: Vec<OutputBlob>,
    /// Diagnostics the compilation printed, replayed on a hit.
    pub diagnostics: Vec<String>,
}

impl CacheEntry {
    /// Total payload size of all outputs.
    pub fn output_bytes(&self) -> u64 {
        self.outputs.iter().map(|o| o.data.len() as u64).sum()
    }

    /// Returns the output blob with the given canonical name.
    pub fn output(&self, name: &str) -> Option<&OutputBlob> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

/// Serializes an entry with its validating header.
pub(crate) fn encode_entry(entry: &CacheEntry) -> Result<Vec<u8>, CacheError> {
    let config = bincode::config::standard();
    let payload = bincode::serde::encode_to_vec(entry, config).map_err(|e| {
        CacheError::Serialization {
            reason: e.to_string(),
        }
    })?;
    let header = EntryHeader {
        magic: ENTRY_MAGIC,
        format_version: ENTRY_FORMAT_VERSION,
        checksum: ContentHash::from_bytes(&payload),
    };
    let header_bytes = bincode::serde::encode_to_vec(&header, config).map_err(|e| {
        CacheError::Serialization {
            reason: e.to_string(),
        }
    })?;

    let mut output = Vec::with_capacity(4 + header_bytes.len() + payload.len());
    output.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    output.extend_from_slice(&header_bytes);
    output.extend_from_slice(&payload);
    Ok(output)
}

/// Parses and validates an entry file's bytes.
///
/// `path` is only used in error messages.
pub(crate) fn decode_entry(path: &Path, raw: &[u8]) -> Result<CacheEntry, CacheError> {
    let invalid = |reason: &str| CacheError::InvalidHeader {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let Some(len_bytes) = raw.get(..4) else {
        return Err(invalid("truncated header length"));
    };
    let mut len = [0u8; 4];
    len.copy_from_slice(len_bytes);
    let header_len = u32::from_le_bytes(len) as usize;
    let Some(header_bytes) = raw.get(4..4 + header_len) else {
        return Err(invalid("truncated header"));
    };

    let config = bincode::config::standard();
    let (header, _): (EntryHeader, usize) =
        bincode::serde::decode_from_slice(header_bytes, config)
            .map_err(|e| invalid(&e.to_string()))?;
    if header.magic != ENTRY_MAGIC {
        return Err(invalid("bad magic bytes"));
    }
    if header.format_version != ENTRY_FORMAT_VERSION {
        return Err(CacheError::VersionMismatch {
            path: path.to_path_buf(),
            expected: ENTRY_FORMAT_VERSION,
            actual: header.format_version,
        });
    }

    let payload = &raw[4 + header_len..];
    let actual = ContentHash::from_bytes(payload);
    if actual != header.checksum {
        return Err(CacheError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: header.checksum.to_string(),
            actual: actual.to_string(),
        });
    }

    let (entry, _): (CacheEntry, usize) = bincode::serde::decode_from_slice(payload, config)
        .map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
    Ok(entry)
}
