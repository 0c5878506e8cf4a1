//! The build state store: what every task looked like when it last succeeded.
//!
//! Stored as `<build root>/build.kilnstate` with the same validating header as
//! cache entries. Loading never fails the build: an unreadable file is
//! treated as an empty store, so every task is decided from scratch.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use kiln_cache::CacheKey;
use kiln_common::ContentHash;
use kiln_fs::Fingerprint;
use kiln_modules::{ScanRecord, VariantTable};
use kiln_plan::RuleInfo;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::signature::Signature;

/// File name of the state store inside the build root.
pub const STATE_FILE_NAME: &str = "build.kilnstate";

/// File locked for the duration of a build.
const LOCK_FILE_NAME: &str = ".kiln.lock";

const STATE_MAGIC: [u8; 4] = *b"KILN";
const STATE_FORMAT_VERSION: u32 = 1;

/// What a task looked like after its last successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Signature at the time of the run.
    pub signature: Signature,
    /// Input fingerprints, sorted by path.
    pub inputs: Vec<(PathBuf, Fingerprint)>,
    /// Output fingerprints after the run.
    pub outputs: Vec<(PathBuf, Fingerprint)>,
    /// Cache key the results were stored under.
    pub cache_key: Option<CacheKey>,
    /// Dependency scan result, for scan-capable tasks.
    pub scan: Option<ScanRecord>,
}

impl TaskRecord {
    /// The recorded fingerprint of an input.
    pub fn input(&self, path: &Path) -> Option<Fingerprint> {
        find(&self.inputs, path)
    }

    /// The recorded fingerprint of an output.
    pub fn output(&self, path: &Path) -> Option<Fingerprint> {
        find(&self.outputs, path)
    }
}

fn find(entries: &[(PathBuf, Fingerprint)], path: &Path) -> Option<Fingerprint> {
    entries
        .iter()
        .find(|(known, _)| known == path)
        .map(|(_, fingerprint)| *fingerprint)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateHeader {
    magic: [u8; 4],
    format_version: u32,
    kiln_version: String,
    checksum: ContentHash,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    records: BTreeMap<RuleInfo, TaskRecord>,
    variants: VariantTable,
    cache_instance: Option<String>,
}

/// Persistent per-task records for one build root.
///
/// Holds an exclusive lock on the build root until dropped.
#[derive(Debug)]
pub struct BuildStateStore {
    path: PathBuf,
    state: StateFile,
    load_warning: Option<String>,
    _lock: File,
}

impl BuildStateStore {
    /// Opens the store in `build_root`, locking the root.
    ///
    /// Fails with [`EngineError::Locked`] if another build holds the root.
    pub fn open(build_root: &Path) -> Result<Self, EngineError> {
        fs::create_dir_all(build_root).map_err(|e| EngineError::io(build_root, e))?;
        let lock_path = build_root.join(LOCK_FILE_NAME);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| EngineError::io(&lock_path, e))?;
        match FileExt::try_lock_exclusive(&lock) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(EngineError::Locked {
                    root: build_root.to_path_buf(),
                })
            }
            Err(e) => return Err(EngineError::io(&lock_path, e)),
        }

        let path = build_root.join(STATE_FILE_NAME);
        let (state, load_warning) = match fs::read(&path) {
            Ok(raw) => match decode_state(&raw) {
                Ok(state) => (state, None),
                Err(reason) => {
                    warn!(path = %path.display(), %reason, "discarding unreadable build state");
                    (StateFile::default(), Some(reason))
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => (StateFile::default(), None),
            Err(e) => {
                warn!(path = %path.display(), %e, "could not read build state");
                (StateFile::default(), Some(e.to_string()))
            }
        };
        debug!(records = state.records.len(), "loaded build state");
        Ok(Self {
            path,
            state,
            load_warning,
            _lock: lock,
        })
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Why the previous state was discarded, if it was.
    pub fn load_warning(&self) -> Option<&str> {
        self.load_warning.as_deref()
    }

    /// The record of a task, if it ever succeeded.
    pub fn record(&self, rule_info: &RuleInfo) -> Option<&TaskRecord> {
        self.state.records.get(rule_info)
    }

    /// All records.
    pub fn records(&self) -> impl Iterator<Item = (&RuleInfo, &TaskRecord)> {
        self.state.records.iter()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.state.records.len()
    }

    /// Returns `true` if no task has a record.
    pub fn is_empty(&self) -> bool {
        self.state.records.is_empty()
    }

    /// Stores the record of a task that completed successfully.
    pub fn commit(&mut self, rule_info: RuleInfo, record: TaskRecord) {
        self.state.records.insert(rule_info, record);
    }

    /// Forgets a task, so it is decided as never built next time.
    pub fn remove(&mut self, rule_info: &RuleInfo) -> Option<TaskRecord> {
        self.state.records.remove(rule_info)
    }

    /// Drops records of tasks that are no longer part of the build.
    pub fn retain_rules(&mut self, live: &HashSet<RuleInfo>) {
        let before = self.state.records.len();
        self.state.records.retain(|rule, _| live.contains(rule));
        let dropped = before - self.state.records.len();
        if dropped > 0 {
            debug!(dropped, "dropped records of removed tasks");
        }
    }

    /// Module variants from the previous build.
    pub fn take_variants(&mut self) -> VariantTable {
        std::mem::take(&mut self.state.variants)
    }

    /// Replaces the module variant table.
    pub fn set_variants(&mut self, variants: VariantTable) {
        self.state.variants = variants;
    }

    /// Instance id of the compilation cache used by the previous build.
    pub fn cache_instance(&self) -> Option<&str> {
        self.state.cache_instance.as_deref()
    }

    /// Records the instance id of the compilation cache used by this build.
    pub fn set_cache_instance(&mut self, instance: Option<String>) {
        self.state.cache_instance = instance;
    }

    /// Writes the store to disk atomically.
    pub fn flush(&self) -> Result<(), EngineError> {
        let bytes = encode_state(&self.state)?;
        let tmp = self.path.with_extension(format!("kilnstate.{}.tmp", std::process::id()));
        {
            let mut file = File::create(&tmp).map_err(|e| EngineError::io(&tmp, e))?;
            file.write_all(&bytes).map_err(|e| EngineError::io(&tmp, e))?;
            file.sync_all().map_err(|e| EngineError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| EngineError::io(&self.path, e))?;
        debug!(records = self.state.records.len(), bytes = bytes.len(), "flushed build state");
        Ok(())
    }
}

fn encode_state(state: &StateFile) -> Result<Vec<u8>, EngineError> {
    let config = bincode::config::standard();
    let serialization = |e: bincode::error::EncodeError| EngineError::Serialization {
        reason: e.to_string(),
    };
    let payload = bincode::serde::encode_to_vec(state, config).map_err(serialization)?;
    let header = StateHeader {
        magic: STATE_MAGIC,
        format_version: STATE_FORMAT_VERSION,
        kiln_version: env!("CARGO_PKG_VERSION").to_string(),
        checksum: ContentHash::from_bytes(&payload),
    };
    let header_bytes = bincode::serde::encode_to_vec(&header, config).map_err(serialization)?;
    let mut output = Vec::with_capacity(4 + header_bytes.len() + payload.len());
    output.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    output.extend_from_slice(&header_bytes);
    output.extend_from_slice(&payload);
    Ok(output)
}

fn decode_state(raw: &[u8]) -> Result<StateFile, String> {
    let len_bytes: [u8; 4] = raw
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or("truncated header length")?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    let header_bytes = raw.get(4..4 + header_len).ok_or("truncated header")?;
    let config = bincode::config::standard();
    let (header, _): (StateHeader, usize) =
        bincode::serde::decode_from_slice(header_bytes, config).map_err(|e| e.to_string())?;
    if header.magic != STATE_MAGIC {
        return Err("bad magic bytes".to_string());
    }
    if header.format_version != STATE_FORMAT_VERSION {
        return Err(format!(
            "format version {} is not {STATE_FORMAT_VERSION}",
            header.format_version
        ));
    }
    if header.kiln_version != env!("CARGO_PKG_VERSION") {
        return Err(format!("written by kiln {}", header.kiln_version));
    }
    let payload = &raw[4 + header_len..];
    if ContentHash::from_bytes(payload) != header.checksum {
        return Err("checksum mismatch".to_string());
    }
    let (state, _): (StateFile, usize) =
        bincode::serde::decode_from_slice(payload, config).map_err(|e| e.to_string())?;
    Ok(state)
}
