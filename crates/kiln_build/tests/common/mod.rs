//! Shared harness for end-to-end build tests: a scratch workspace and a
//! scripted executor that writes deterministic outputs.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use kiln_build::{
    BuildReport, BuildSession, CancellationToken, ExecOutcome, ExecRequest, Executor, ScanRequest,
};
use kiln_config::BuildConfig;
use kiln_modules::{ModuleDecl, ScanError, ScanOutput};
use kiln_plan::{CacheKind, Task};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// A temporary source tree with a `build/` root and a cache beside it.
pub struct Workspace {
    dir: TempDir,
    root: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("ws");
        fs::create_dir_all(&root).unwrap();
        Self { dir, root }
    }

    /// A second checkout next to this one, sharing the same temp directory.
    pub fn sibling(&self, name: &str) -> PathBuf {
        let root = self.dir.path().join(name);
        fs::create_dir_all(&root).unwrap();
        root
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) {
        write_file(&self.path(rel), content);
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).unwrap()
    }

    pub fn remove(&self, rel: &str) {
        let path = self.path(rel);
        if path.is_dir() {
            fs::remove_dir_all(path).unwrap();
        } else {
            fs::remove_file(path).unwrap();
        }
    }

    /// Configuration with the cache in a directory shared by every checkout.
    pub fn config(&self) -> BuildConfig {
        let mut config = BuildConfig::default();
        config.cache.path = Some(self.cache_root());
        config.build.jobs = Some(4);
        config
    }

    pub fn cache_root(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn session(&self) -> BuildSession {
        BuildSession::new(&self.root, self.config())
    }

    pub fn session_with(&self, config: BuildConfig) -> BuildSession {
        BuildSession::new(&self.root, config)
    }
}

pub fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

// ---------------------------------------------------------------------------
// Task builders
// ---------------------------------------------------------------------------

/// `Compile <name>.c`: `src/<name>.c` to `build/<name>.o`, cacheable.
pub fn compile(root: &Path, name: &str) -> Task {
    let object = format!("build/{name}.o");
    let source = format!("src/{name}.c");
    Task::new(
        ["CompileC", object.as_str()],
        vec![
            "cc".to_string(),
            "-c".to_string(),
            source.clone(),
            "-o".to_string(),
            object.clone(),
        ],
    )
    .with_description(format!("Compile {name}.c"))
    .with_working_directory(root)
    .with_inputs([source])
    .with_outputs([object])
    .cacheable(CacheKind::Compile)
}

/// A scan-capable compile of `src/<name>.c`.
pub fn scanned_compile(root: &Path, name: &str) -> Task {
    let task = compile(root, name);
    let source = root.join(format!("src/{name}.c"));
    task.scans(source)
}

/// `Link <name>`: the given objects to `build/<name>`.
pub fn link(root: &Path, name: &str, objects: &[&str]) -> Task {
    let output = format!("build/{name}");
    let inputs: Vec<String> = objects.iter().map(|o| format!("build/{o}.o")).collect();
    let mut command = vec!["ld".to_string(), "-o".to_string(), output.clone()];
    command.extend(inputs.iter().cloned());
    Task::new(["Ld", output.as_str()], command)
        .with_description(format!("Link {name}"))
        .with_working_directory(root)
        .with_inputs(inputs)
        .with_outputs([output])
}

// ---------------------------------------------------------------------------
// Scan output builders
// ---------------------------------------------------------------------------

pub fn module(name: &str, defining_input: &Path, imports: &[&str]) -> ModuleDecl {
    ModuleDecl {
        name: name.to_string(),
        defining_inputs: vec![defining_input.to_path_buf()],
        arguments: vec!["-x".to_string(), "c".to_string()],
        imports: imports.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn scan_output(imports: &[&str], modules: Vec<ModuleDecl>, files: Vec<PathBuf>) -> ScanOutput {
    ScanOutput {
        file_dependencies: files,
        modules,
        imports: imports.iter().map(|s| s.to_string()).collect(),
        unresolved: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

/// Writes each output as the command line followed by the contents of every
/// input. Mutators append a line to each mutated file instead.
#[derive(Default)]
pub struct ScriptedExecutor {
    scans: Mutex<HashMap<PathBuf, String>>,
    failing: Mutex<HashSet<String>>,
    salt: Mutex<Option<String>>,
    cancel_after: Mutex<Option<(String, CancellationToken)>>,
    executed: Mutex<Vec<String>>,
    scanned: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answers scans of `source` with `output`.
    pub fn set_scan(&self, source: &Path, output: &ScanOutput) {
        let json = serde_json::to_string(output).unwrap();
        self.set_scan_json(source, &json);
    }

    /// Answers scans of `source` with raw JSON text.
    pub fn set_scan_json(&self, source: &Path, json: &str) {
        self.scans
            .lock()
            .unwrap()
            .insert(source.to_path_buf(), json.to_string());
    }

    pub fn fail(&self, description: &str) {
        self.failing.lock().unwrap().insert(description.to_string());
    }

    pub fn recover(&self, description: &str) {
        self.failing.lock().unwrap().remove(description);
    }

    /// Makes every output differ from what an earlier run produced.
    pub fn set_salt(&self, salt: &str) {
        *self.salt.lock().unwrap() = Some(salt.to_string());
    }

    /// Cancels `token` once `description` has executed.
    pub fn cancel_after(&self, description: &str, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((description.to_string(), token));
    }

    /// Descriptions executed so far, drained.
    pub fn take_executed(&self) -> Vec<String> {
        let mut executed = std::mem::take(&mut *self.executed.lock().unwrap());
        executed.sort();
        executed
    }

    /// Descriptions scanned so far, drained.
    pub fn take_scanned(&self) -> Vec<String> {
        let mut scanned = std::mem::take(&mut *self.scanned.lock().unwrap());
        scanned.sort();
        scanned
    }

    /// How many times tasks whose description starts with `prefix` executed.
    pub fn count_executed(&self, prefix: &str) -> usize {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.starts_with(prefix))
            .count()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(&self, request: &ExecRequest<'_>) -> ExecOutcome {
        let task = request.task;
        self.executed.lock().unwrap().push(task.description.clone());
        if self.failing.lock().unwrap().contains(&task.description) {
            return ExecOutcome::failure(1, format!("{}: error: scripted failure", task.description));
        }

        for path in &task.capabilities.mutates {
            let mut content = fs::read_to_string(path).unwrap_or_default();
            content.push_str(&format!("mutated by {}\n", task.description));
            write_file(path, &content);
        }

        let mut content = format!("{}\n", task.command.join(" "));
        for input in task.inputs.iter().chain(request.discovered_inputs) {
            if let Ok(text) = fs::read_to_string(input) {
                content.push_str(&text);
            }
        }
        if let Some(salt) = self.salt.lock().unwrap().as_ref() {
            content.push_str(salt);
        }
        for output in &task.outputs {
            if !task.capabilities.mutates.contains(output) {
                write_file(output, &content);
            }
        }

        if let Some((description, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if *description == task.description {
                token.cancel();
            }
        }
        ExecOutcome::success()
    }

    fn scan(&self, request: &ScanRequest<'_>) -> Result<ScanOutput, ScanError> {
        self.scanned
            .lock()
            .unwrap()
            .push(request.task.description.clone());
        let json = self.scans.lock().unwrap().get(request.source).cloned();
        match json {
            Some(json) => ScanOutput::from_json(&request.task.description, &json),
            None => Ok(ScanOutput::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Report helpers
// ---------------------------------------------------------------------------

/// Category names of a task's backtrace.
pub fn categories(report: &BuildReport, description: &str) -> Vec<String> {
    report
        .backtrace(description)
        .unwrap_or_else(|| panic!("no task '{description}'"))
        .categories()
        .into_iter()
        .map(|c| c.as_str().to_string())
        .collect()
}

/// Rendered backtrace lines of a task.
pub fn backtrace_lines(report: &BuildReport, description: &str) -> Vec<String> {
    report
        .backtrace(description)
        .unwrap_or_else(|| panic!("no task '{description}'"))
        .to_string()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Index of the first event matching `pred`.
pub fn position(report: &BuildReport, pred: impl Fn(&kiln_build::BuildEvent) -> bool) -> usize {
    report
        .events
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("event not found in {:?}", report.events))
}
