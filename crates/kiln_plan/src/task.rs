//! Tasks: the immutable units of declared work.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Ordered tuple of descriptive strings identifying a task.
///
/// The first element is the rule kind (`CompileC`, `Ld`, `CodeSign`, ...),
/// used to group metrics. The whole tuple identifies the task across builds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleInfo(Vec<String>);

impl RuleInfo {
    /// Creates rule info from its parts.
    pub fn new<S: Into<String>>(parts: impl IntoIterator<Item = S>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Returns the rule kind, or an empty string for empty rule info.
    pub fn kind(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    /// Returns all parts in order.
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Returns `true` if there are no parts.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// The cache a cacheable task consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CacheKind {
    /// Compiler invocations, including module builds.
    Compile,
    /// Any other deterministic tool.
    Generic,
}

impl CacheKind {
    /// Every cache kind, in report order.
    pub const ALL: [CacheKind; 2] = [CacheKind::Compile, CacheKind::Generic];

    /// Returns the lowercase name used in cache directories and metric keys.
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::Compile => "compile",
            CacheKind::Generic => "generic",
        }
    }
}

/// How a scan-capable task discovers its module dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSpec {
    /// The primary source file being scanned.
    pub source: PathBuf,
}

/// The capability set of a task.
///
/// The scheduler branches on these explicitly; a task with none of them is a
/// plain command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Results may be served from the compilation cache.
    pub cache: Option<CacheKind>,
    /// Module dependencies are discovered by a scan step before running.
    pub scan: Option<ScanSpec>,
    /// Filesystem subtrees modified in place rather than produced.
    pub mutates: Vec<PathBuf>,
}

/// A unit of declared work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Identity across builds.
    pub rule_info: RuleInfo,
    /// Human-readable execution description used in backtraces and diagnostics.
    pub description: String,
    /// Program and arguments.
    pub command: Vec<String>,
    /// Environment variables that affect the command.
    pub environment: BTreeMap<String, String>,
    /// Directory the command runs in. Relative paths resolve against it.
    pub working_directory: PathBuf,
    /// Declared input paths.
    pub inputs: Vec<PathBuf>,
    /// Declared output paths.
    pub outputs: Vec<PathBuf>,
    /// Run in every build regardless of state.
    pub always_out_of_date: bool,
    /// Target the task belongs to, for module sharing and dependency checks.
    pub target: Option<String>,
    /// Capability set.
    pub capabilities: Capabilities,
}

impl Task {
    /// Creates a task with the given rule info and command.
    ///
    /// The description defaults to the rule info joined by spaces.
    pub fn new<S: Into<String>>(rule_info: impl IntoIterator<Item = S>, command: Vec<String>) -> Self {
        let rule_info = RuleInfo::new(rule_info);
        Self {
            description: rule_info.to_string(),
            rule_info,
            command,
            environment: BTreeMap::new(),
            working_directory: PathBuf::from("/"),
            inputs: Vec::new(),
            outputs: Vec::new(),
            always_out_of_date: false,
            target: None,
            capabilities: Capabilities::default(),
        }
    }

    /// Sets the execution description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds declared inputs.
    pub fn with_inputs<P: Into<PathBuf>>(mut self, inputs: impl IntoIterator<Item = P>) -> Self {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    /// Adds declared outputs.
    pub fn with_outputs<P: Into<PathBuf>>(mut self, outputs: impl IntoIterator<Item = P>) -> Self {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable to the signature-relevant subset.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory.
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    /// Assigns the task to a target.
    pub fn in_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Marks the task to run in every build.
    pub fn always_out_of_date(mut self) -> Self {
        self.always_out_of_date = true;
        self
    }

    /// Makes the task's results cacheable.
    pub fn cacheable(mut self, kind: CacheKind) -> Self {
        self.capabilities.cache = Some(kind);
        self
    }

    /// Makes the task scan `source` for module dependencies before running.
    pub fn scans(mut self, source: impl Into<PathBuf>) -> Self {
        self.capabilities.scan = Some(ScanSpec {
            source: source.into(),
        });
        self
    }

    /// Declares subtrees the task modifies in place.
    ///
    /// Mutated paths are both inputs and outputs of the task.
    pub fn mutates<P: Into<PathBuf>>(mut self, paths: impl IntoIterator<Item = P>) -> Self {
        for path in paths {
            let path = path.into();
            if !self.inputs.contains(&path) {
                self.inputs.push(path.clone());
            }
            if !self.outputs.contains(&path) {
                self.outputs.push(path.clone());
            }
            self.capabilities.mutates.push(path);
        }
        self
    }

    /// Returns `true` if the task modifies shared outputs in place.
    pub fn mutates_shared_outputs(&self) -> bool {
        !self.capabilities.mutates.is_empty()
    }

    /// Returns the cache kind when the task is cacheable.
    pub fn cache_kind(&self) -> Option<CacheKind> {
        self.capabilities.cache
    }

    /// Returns the scan specification when the task is scan-capable.
    pub fn scan_spec(&self) -> Option<&ScanSpec> {
        self.capabilities.scan.as_ref()
    }
}
