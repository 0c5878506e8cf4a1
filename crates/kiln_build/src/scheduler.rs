//! The coordinator loop and the work it hands to the worker pool.
//!
//! One coordinator thread owns the graph, the build state store and the
//! module registry. Workers receive self-contained jobs, decide and execute
//! them against shared read-mostly services, and report back over a
//! channel. A node waiting for a scan or for module builds is never held by
//! a worker: it stays in the graph until its dependencies finish and is then
//! queued again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;

use kiln_cache::{
    verify_outputs, CacheEntry, CacheKey, CacheMetrics, CompilationCache, KeyCanonicalizer,
    KeyMaterial, Lookup, OutputBlob,
};
use kiln_common::paths::subtrees_overlap;
use kiln_common::{NodeId, TaskId};
use kiln_config::MissingDependencyLevel;
use kiln_diagnostics::{Diagnostic, DiagnosticCode, DiagnosticSink};
use kiln_engine::{
    decide, BuildStateStore, Cause, ComputedSignature, Decision, DecisionInput, InputWriter,
    OutputCheck, Signature, SignatureComputer, TaskRecord,
};
use kiln_fs::{Fingerprint, FingerprintStore, FsError};
use kiln_modules::{
    missing_dependency_diagnostic, DependencyScanner, ModuleCoordinator, ScanError, ScanRecord,
};
use kiln_plan::{BuildPlan, CacheKind, Task, Writer};
use rayon::ThreadPool;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::events::{BuildEvent, EventLog};
use crate::executor::{ExecRequest, Executor, ScanRequest};
use crate::graph::{BuildGraph, Expansion, NodeOrigin, NodeState};
use crate::report::TaskOutcome;

/// Read-mostly state shared by every worker.
pub(crate) struct Services {
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) fingerprints: Arc<FingerprintStore>,
    pub(crate) signatures: SignatureComputer,
    pub(crate) scanner: DependencyScanner,
    pub(crate) cache: Option<Arc<CompilationCache>>,
    pub(crate) canonicalizer: KeyCanonicalizer,
    pub(crate) metrics: Arc<CacheMetrics>,
    pub(crate) events: Arc<EventLog>,
    pub(crate) diagnostics: Arc<DiagnosticSink>,
    pub(crate) cancel: CancellationToken,
    pub(crate) cache_lost: bool,
    pub(crate) verify: bool,
    pub(crate) remarks: bool,
}

/// Scheduling switches taken from the configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SchedulerOptions {
    pub(crate) modules: bool,
    pub(crate) missing_dependencies: MissingDependencyLevel,
}

/// The graph after the loop drained, with every node's outcome.
pub(crate) struct Schedule {
    pub(crate) graph: BuildGraph,
    pub(crate) outcomes: HashMap<NodeId, TaskOutcome>,
}

/// Marker for a failure that was already reported.
struct Reported;

struct Finished {
    cause: Option<Cause>,
    record: Option<TaskRecord>,
    outcome: TaskOutcome,
}

enum Completion {
    Scanned {
        node: NodeId,
        result: Result<ScanRecord, ScanError>,
    },
    Finished {
        node: NodeId,
        finished: Finished,
    },
    Failed {
        node: NodeId,
    },
    Cancelled {
        node: NodeId,
    },
}

struct RunJob {
    node: NodeId,
    task: Arc<Task>,
    discovered: Vec<PathBuf>,
    record: Option<TaskRecord>,
    writers: HashMap<PathBuf, InputWriter>,
    inexact_outputs: HashSet<PathBuf>,
    scan: Option<ScanRecord>,
}

pub(crate) struct Scheduler<'a> {
    plan: &'a BuildPlan,
    options: SchedulerOptions,
    services: Arc<Services>,
    store: &'a mut BuildStateStore,
    modules: &'a mut ModuleCoordinator,
    graph: BuildGraph,
    ready: VecDeque<NodeId>,
    in_flight: usize,
    outcomes: HashMap<NodeId, TaskOutcome>,
    mutated_paths: Vec<(PathBuf, TaskId)>,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(
        plan: &'a BuildPlan,
        options: SchedulerOptions,
        services: Arc<Services>,
        store: &'a mut BuildStateStore,
        modules: &'a mut ModuleCoordinator,
    ) -> Self {
        let mutated_paths = plan
            .tasks()
            .flat_map(|(id, task)| {
                task.capabilities
                    .mutates
                    .iter()
                    .map(move |path| (path.clone(), id))
            })
            .collect();
        Self {
            plan,
            options,
            services,
            store,
            modules,
            graph: BuildGraph::from_plan(plan),
            ready: VecDeque::new(),
            in_flight: 0,
            outcomes: HashMap::new(),
            mutated_paths,
        }
    }

    /// Runs every node to a terminal state.
    pub(crate) fn run(mut self, pool: &ThreadPool) -> Schedule {
        let (tx, rx) = mpsc::channel();
        self.ready.extend(
            self.graph
                .iter()
                .filter(|(_, node)| node.is_unblocked())
                .map(|(id, _)| id),
        );

        loop {
            while let Some(node) = self.ready.pop_front() {
                if self.services.cancel.is_cancelled() {
                    self.cancel(node);
                } else {
                    self.start(node, pool, &tx);
                }
            }
            if self.in_flight == 0 {
                break;
            }
            let Ok(completion) = rx.recv() else {
                break;
            };
            self.in_flight -= 1;
            self.handle(completion);
        }

        let unfinished: Vec<NodeId> = self
            .graph
            .iter()
            .filter(|(_, node)| !node.state.is_terminal())
            .map(|(id, _)| id)
            .collect();
        if !unfinished.is_empty() && !self.services.cancel.is_cancelled() {
            warn!(count = unfinished.len(), "tasks never became ready");
        }
        for node in unfinished {
            self.cancel(node);
        }

        Schedule {
            graph: self.graph,
            outcomes: self.outcomes,
        }
    }

    fn start(&mut self, node: NodeId, pool: &ThreadPool, tx: &Sender<Completion>) {
        let entry = self.graph.node(node);
        let scans = entry.state == NodeState::Pending
            && entry.task_id().is_some()
            && entry.task.scan_spec().is_some();
        if let NodeOrigin::Module { scope, key, .. } = &entry.origin {
            let scope = scope.to_string();
            let key = key.clone();
            self.modules.variants_mut().mark_building(&scope, &key);
        }

        let services = Arc::clone(&self.services);
        let tx = tx.clone();
        if scans {
            let task = Arc::clone(&entry.task);
            let previous = self
                .store
                .record(&task.rule_info)
                .and_then(|record| record.scan.clone());
            self.graph.node_mut(node).state = NodeState::Scanning;
            pool.spawn(move || {
                let completion = scan_task(&services, node, &task, previous);
                let _ = tx.send(completion);
            });
        } else {
            let job = self.prepare(node);
            self.graph.node_mut(node).state = NodeState::Running;
            pool.spawn(move || {
                let completion = run_task(&services, job);
                let _ = tx.send(completion);
            });
        }
        self.in_flight += 1;
    }

    fn prepare(&self, node: NodeId) -> RunJob {
        let entry = self.graph.node(node);
        let task = Arc::clone(&entry.task);
        let writers = task
            .inputs
            .iter()
            .chain(&entry.discovered)
            .filter_map(|input| Some((input.clone(), self.writer_of(node, input)?)))
            .collect();
        let inexact_outputs = match entry.task_id() {
            // A mutated output is also an input, so a tampered one is still caught.
            Some(id) => task
                .outputs
                .iter()
                .filter(|output| {
                    task.capabilities.mutates.contains(*output) || self.mutated_later(id, output)
                })
                .cloned()
                .collect(),
            None => HashSet::new(),
        };
        RunJob {
            node,
            record: self.store.record(&task.rule_info).cloned(),
            task,
            discovered: entry.discovered.clone(),
            writers,
            inexact_outputs,
            scan: entry.scan.clone(),
        }
    }

    /// The task whose write a consumer sees for `input`.
    fn writer_of(&self, consumer: NodeId, input: &Path) -> Option<InputWriter> {
        let planned = match self.graph.node(consumer).task_id() {
            Some(id) => self.plan.writer_for(id, input),
            None => self.plan.producer_of(input).map(Writer::Produced),
        };
        if let Some(writer) = planned {
            let node = BuildGraph::node_for_task(writer.task());
            let mutated = match writer {
                Writer::Mutated(id) => Some(self.plan.task(id).capabilities.mutates.clone()),
                Writer::Produced(_) => None,
            };
            return Some(InputWriter {
                node,
                ran: self.graph.node(node).ran,
                mutated,
            });
        }
        let node = self.graph.dynamic_producer(input)?;
        Some(InputWriter {
            node,
            ran: self.graph.node(node).ran,
            mutated: None,
        })
    }

    fn mutated_later(&self, id: TaskId, output: &Path) -> bool {
        self.mutated_paths
            .iter()
            .any(|(path, owner)| *owner > id && subtrees_overlap(path, output))
    }

    fn handle(&mut self, completion: Completion) {
        match completion {
            Completion::Scanned { node, result } => match result {
                Ok(record) => self.expand(node, record),
                Err(err) => {
                    let task = &self.graph.node(node).task;
                    error!(task = %task.description, %err, "dependency scan failed");
                    self.services.diagnostics.emit(
                        Diagnostic::error(DiagnosticCode::SCAN_FAILED, err.to_string())
                            .with_subject(task.description.clone()),
                    );
                    self.fail(node);
                }
            },
            Completion::Finished { node, finished } => self.finish(node, finished),
            Completion::Failed { node } => self.fail(node),
            Completion::Cancelled { node } => self.cancel(node),
        }
    }

    /// Inserts the module builds a scan asked for, then parks or queues the consumer.
    fn expand(&mut self, node: NodeId, record: ScanRecord) {
        let task = Arc::clone(&self.graph.node(node).task);
        let mut discovered = record.file_dependencies().to_vec();
        let mut dependencies = Vec::new();

        if self.options.modules {
            let scope = self.modules.scope_for(task.target.as_deref());
            for module in &record.modules {
                let module_node = match self.modules.node_for(&scope, &module.key) {
                    Some(existing) => existing,
                    None => {
                        let imports: Vec<NodeId> = module
                            .imports
                            .iter()
                            .filter_map(|import| self.modules.node_for(&scope, import))
                            .collect();
                        let module_task = self.modules.module_task(&scope, module, &task);
                        let description = module_task.description.clone();
                        let id = self.graph.add_module_node(
                            module_task,
                            scope.clone(),
                            module.key.clone(),
                            node,
                            &imports,
                        );
                        self.modules.register(&scope, &module.key, id);
                        debug!(
                            module = %module.key,
                            %scope,
                            requested_by = %task.description,
                            "registered module build"
                        );
                        self.services.events.push(BuildEvent::DynamicTaskRegistered {
                            task: description,
                            requested_by: task.description.clone(),
                        });
                        if self.graph.node(id).state == NodeState::Blocked {
                            self.mark_blocked(id);
                        } else if self.graph.node(id).is_unblocked() {
                            self.ready.push_back(id);
                        }
                        id
                    }
                };
                discovered.push(self.modules.output_path(&scope, &module.key));
                dependencies.push(module_node);
            }

            if let Some(spec) = task.scan_spec() {
                for module in &record.output.imports {
                    if let Some(diag) = missing_dependency_diagnostic(
                        self.plan,
                        &task,
                        &spec.source,
                        module,
                        self.options.missing_dependencies,
                    ) {
                        self.services.diagnostics.emit(diag);
                    }
                }
            }
        }

        self.graph.node_mut(node).scan = Some(record);
        match self.graph.expand(node, &dependencies, discovered) {
            Expansion::Ready => self.ready.push_back(node),
            Expansion::Waiting => {
                debug!(task = %task.description, modules = dependencies.len(), "waiting for module builds");
            }
            Expansion::Blocked => {
                self.mark_blocked(node);
                for blocked in self.graph.block(node) {
                    self.mark_blocked(blocked);
                }
            }
        }
    }

    fn finish(&mut self, node: NodeId, finished: Finished) {
        let Finished {
            cause,
            record,
            outcome,
        } = finished;
        let entry = self.graph.node_mut(node);
        entry.cause = cause;
        entry.ran = outcome.ran();
        let rule_info = entry.task.rule_info.clone();
        let scan = entry.scan.clone();
        let origin = entry.origin.clone();

        match record {
            Some(record) => self.store.commit(rule_info, record),
            None => {
                let refreshed = match (scan, self.store.record(&rule_info)) {
                    (Some(scan), Some(previous)) if previous.scan.as_ref() != Some(&scan) => {
                        let mut refreshed = previous.clone();
                        refreshed.scan = Some(scan);
                        Some(refreshed)
                    }
                    _ => None,
                };
                if let Some(refreshed) = refreshed {
                    self.store.commit(rule_info, refreshed);
                }
            }
        }

        if let NodeOrigin::Module { scope, key, .. } = &origin {
            self.modules.variants_mut().mark_built(&scope.to_string(), key);
            if outcome.ran() {
                self.modules.report_mut().record_built(&key.name);
            }
        }

        self.outcomes.insert(node, outcome);
        let unblocked = self.graph.complete(node);
        self.ready.extend(unblocked);
    }

    fn fail(&mut self, node: NodeId) {
        let rule_info = self.graph.node(node).task.rule_info.clone();
        self.store.remove(&rule_info);
        if let NodeOrigin::Module { scope, key, .. } = &self.graph.node(node).origin {
            let scope = scope.to_string();
            let key = key.clone();
            self.modules.variants_mut().mark_failed(&scope, &key);
        }
        self.outcomes.insert(node, TaskOutcome::Failed);
        for blocked in self.graph.fail(node) {
            self.mark_blocked(blocked);
        }
    }

    fn mark_blocked(&mut self, node: NodeId) {
        let description = self.graph.node(node).task.description.clone();
        warn!(task = %description, "not attempted: a dependency failed");
        self.services
            .events
            .push(BuildEvent::TaskBlocked(description));
        self.outcomes.insert(node, TaskOutcome::Blocked);
    }

    fn cancel(&mut self, node: NodeId) {
        let entry = self.graph.node_mut(node);
        entry.state = NodeState::Cancelled;
        let description = entry.task.description.clone();
        debug!(task = %description, "cancelled");
        self.services
            .events
            .push(BuildEvent::TaskCancelled(description));
        self.outcomes.insert(node, TaskOutcome::Cancelled);
    }
}

fn scan_task(
    services: &Services,
    node: NodeId,
    task: &Task,
    previous: Option<ScanRecord>,
) -> Completion {
    if services.cancel.is_cancelled() {
        return Completion::Cancelled { node };
    }
    let description = task.description.clone();
    let command = Signature::command_half(task);
    if let Some(previous) = previous {
        if services
            .scanner
            .can_reuse(Some(&previous), command, services.cache_lost)
        {
            debug!(task = %description, "reusing previous dependency scan");
            services.events.push(BuildEvent::ScanReused(description));
            return Completion::Scanned {
                node,
                result: Ok(previous),
            };
        }
    }

    let Some(spec) = task.scan_spec() else {
        return Completion::Scanned {
            node,
            result: Err(ScanError::Failed {
                task: description,
                reason: "task has no scan source".to_string(),
            }),
        };
    };
    services
        .events
        .push(BuildEvent::ScanStarted(description.clone()));
    let result = services
        .executor
        .scan(&ScanRequest {
            task,
            source: &spec.source,
        })
        .and_then(|output| services.scanner.resolve(task, command, output));
    let event = match &result {
        Ok(_) => BuildEvent::ScanCompleted(description),
        Err(_) => BuildEvent::ScanFailed(description),
    };
    services.events.push(event);
    Completion::Scanned { node, result }
}

fn run_task(services: &Services, job: RunJob) -> Completion {
    let node = job.node;
    match decide_and_run(services, &job) {
        Ok(Some(finished)) => Completion::Finished { node, finished },
        Ok(None) => Completion::Cancelled { node },
        Err(Reported) => {
            services
                .events
                .push(BuildEvent::TaskFailed(job.task.description.clone()));
            Completion::Failed { node }
        }
    }
}

/// Decides one task and, if it must run, restores or executes it.
///
/// `Ok(None)` means the build was cancelled before anything was written.
fn decide_and_run(services: &Services, job: &RunJob) -> Result<Option<Finished>, Reported> {
    let task = job.task.as_ref();
    let description = task.description.as_str();

    let is_produced = |path: &Path| job.writers.contains_key(path);
    let computed = services
        .signatures
        .compute(task, &job.discovered, &is_produced)
        .map_err(|err| report(services, task, DiagnosticCode::SIGNATURE_FAILED, err))?;
    let outputs = output_checks(services, task, &job.inexact_outputs)
        .map_err(|err| report(services, task, DiagnosticCode::SIGNATURE_FAILED, err))?;

    let writer_of = |path: &Path| job.writers.get(path).cloned();
    let decision = decide(&DecisionInput {
        task,
        record: job.record.as_ref(),
        signature: &computed,
        outputs: &outputs,
        cache_lost: services.cache_lost,
        mode: services.fingerprints.mode(),
        writer_of: &writer_of,
    });
    let cause = match decision {
        Decision::UpToDate => {
            services
                .events
                .push(BuildEvent::UpToDate(description.to_string()));
            return Ok(Some(Finished {
                cause: None,
                record: None,
                outcome: TaskOutcome::UpToDate,
            }));
        }
        Decision::MustRun(cause) => cause,
    };
    if services.cancel.is_cancelled() {
        return Ok(None);
    }

    let cache_key = cache_key(services, task, &computed, job.scan.as_ref());
    let outcome = match &cache_key {
        Some((kind, key)) => run_cached(services, job, *kind, key)?,
        None => {
            execute(services, job)?;
            TaskOutcome::Executed
        }
    };

    for path in task.outputs.iter().chain(&task.capabilities.mutates) {
        services.fingerprints.invalidate(path);
    }
    let produced = services
        .fingerprints
        .fingerprint_all(&task.outputs)
        .map_err(|err| report(services, task, DiagnosticCode::TASK_FAILED, err))?;
    if let Some((path, _)) = produced.iter().find(|(_, fp)| fp.is_missing()) {
        return Err(report(
            services,
            task,
            DiagnosticCode::TASK_FAILED,
            format!("'{description}' did not produce '{}'", path.display()),
        ));
    }

    let ComputedSignature { signature, inputs } = computed;
    let (signature, inputs) = if task.mutates_shared_outputs() {
        let inputs = refresh_mutated(services, task, inputs)
            .map_err(|err| report(services, task, DiagnosticCode::TASK_FAILED, err))?;
        (Signature::of(task, &inputs), inputs)
    } else {
        (signature, inputs)
    };

    services
        .events
        .push(BuildEvent::TaskCompleted(description.to_string()));
    Ok(Some(Finished {
        cause: Some(cause),
        record: Some(TaskRecord {
            signature,
            inputs,
            outputs: produced,
            cache_key: cache_key.map(|(_, key)| key),
            scan: job.scan.clone(),
        }),
        outcome,
    }))
}

/// Consults the cache, then restores or executes and populates it.
fn run_cached(
    services: &Services,
    job: &RunJob,
    kind: CacheKind,
    key: &CacheKey,
) -> Result<TaskOutcome, Reported> {
    let task = job.task.as_ref();
    let description = task.description.as_str();
    let Some(cache) = services.cache.as_deref() else {
        execute(services, job)?;
        return Ok(TaskOutcome::Executed);
    };

    let hit = match cache.lookup(kind, key) {
        Ok(Lookup::Hit(entry)) if is_complete(services, task, &entry) => Some(entry),
        Ok(Lookup::Hit(_)) => {
            warn!(%key, task = description, "cache entry lacks declared outputs, evicting");
            if let Err(err) = cache.remove(kind, key) {
                warn!(%key, %err, "failed to evict cache entry");
            }
            None
        }
        Ok(Lookup::Miss) => None,
        Err(err) => {
            warn!(%key, task = description, %err, "cache lookup failed, treating as miss");
            None
        }
    };
    services
        .metrics
        .record(kind, task.rule_info.kind(), hit.is_some());
    let verdict = if hit.is_some() { "hit" } else { "miss" };
    debug!(%key, task = description, "cache {verdict}");
    services.events.push(if hit.is_some() {
        BuildEvent::CacheHit(description.to_string())
    } else {
        BuildEvent::CacheMiss(description.to_string())
    });
    if services.remarks {
        services.diagnostics.emit(
            Diagnostic::note(DiagnosticCode::CACHE_REMARK, format!("cache {verdict}: {key}"))
                .with_subject(description),
        );
    }

    match hit {
        Some(cached) if services.verify => {
            let stderr = execute(services, job)?;
            let Some(fresh) = collect_entry(services, task, stderr) else {
                warn!(%key, task = description, "outputs could not be collected, cache hit not verified");
                services.diagnostics.emit(
                    Diagnostic::warning(
                        DiagnosticCode::CACHE_NOT_VERIFIED,
                        format!("cache entry {key} was not verified: outputs could not be read back"),
                    )
                    .with_subject(description),
                );
                return Ok(TaskOutcome::Executed);
            };
            if let Err(err) = verify_outputs(key, description, &cached, &fresh) {
                if let Err(evict) = cache.remove(kind, key) {
                    warn!(%key, err = %evict, "failed to evict cache entry");
                }
                return Err(report(services, task, DiagnosticCode::CACHE_INTEGRITY, err));
            }
            Ok(TaskOutcome::Executed)
        }
        Some(cached) => match restore(services, task, &cached) {
            Ok(()) => {
                for line in &cached.diagnostics {
                    info!(task = description, "{line}");
                }
                Ok(TaskOutcome::Restored)
            }
            Err(err) => {
                warn!(task = description, %err, "restoring cached outputs failed, running task");
                execute(services, job)?;
                Ok(TaskOutcome::Executed)
            }
        },
        None => {
            let stderr = execute(services, job)?;
            if let Some(entry) = collect_entry(services, task, stderr) {
                if let Err(err) = cache.store(kind, key, &entry) {
                    warn!(%key, task = description, %err, "failed to store cache entry");
                }
            }
            Ok(TaskOutcome::Executed)
        }
    }
}

/// Runs the task through the executor, returning its standard error.
fn execute(services: &Services, job: &RunJob) -> Result<String, Reported> {
    let task = job.task.as_ref();
    debug!(task = %task.description, "executing");
    services
        .events
        .push(BuildEvent::TaskStarted(task.description.clone()));
    let outcome = services.executor.execute(&ExecRequest {
        task,
        discovered_inputs: &job.discovered,
    });
    if outcome.succeeded() {
        return Ok(outcome.stderr);
    }
    let mut diag = Diagnostic::error(
        DiagnosticCode::TASK_FAILED,
        format!(
            "'{}' failed with exit status {}",
            task.description, outcome.exit_status
        ),
    )
    .with_subject(task.description.clone());
    if !outcome.stderr.trim().is_empty() {
        diag = diag.with_note(outcome.stderr.trim_end().to_string());
    }
    error!(task = %task.description, status = outcome.exit_status, "task failed");
    services.diagnostics.emit(diag);
    Err(Reported)
}

fn report(
    services: &Services,
    task: &Task,
    code: DiagnosticCode,
    err: impl std::fmt::Display,
) -> Reported {
    error!(task = %task.description, %err, "task failed");
    services.diagnostics.emit(
        Diagnostic::error(code, err.to_string()).with_subject(task.description.clone()),
    );
    Reported
}

fn output_checks(
    services: &Services,
    task: &Task,
    inexact: &HashSet<PathBuf>,
) -> Result<Vec<OutputCheck>, FsError> {
    Ok(services
        .fingerprints
        .fingerprint_all(&task.outputs)?
        .into_iter()
        .map(|(path, current)| OutputCheck {
            exact: !inexact.contains(&path),
            path,
            current,
        })
        .collect())
}

/// Re-fingerprints the inputs a mutator just modified.
fn refresh_mutated(
    services: &Services,
    task: &Task,
    inputs: Vec<(PathBuf, Fingerprint)>,
) -> Result<Vec<(PathBuf, Fingerprint)>, FsError> {
    inputs
        .into_iter()
        .map(|(path, fingerprint)| {
            let mutated = task
                .capabilities
                .mutates
                .iter()
                .any(|m| subtrees_overlap(m, &path));
            if mutated {
                Ok((path.clone(), services.fingerprints.fingerprint(&path)?))
            } else {
                Ok((path, fingerprint))
            }
        })
        .collect()
}

/// Computes the cache key, or `None` if the task is not cached in this build.
fn cache_key(
    services: &Services,
    task: &Task,
    computed: &ComputedSignature,
    scan: Option<&ScanRecord>,
) -> Option<(CacheKind, CacheKey)> {
    let kind = task.cache_kind()?;
    services.cache.as_ref()?;
    let mut inputs = Vec::with_capacity(computed.inputs.len());
    for (path, fingerprint) in &computed.inputs {
        let hash = match fingerprint {
            Fingerprint::Content(hash) | Fingerprint::Tree(hash) => *hash,
            Fingerprint::Stat { .. } => match services.fingerprints.content_hash(path) {
                Ok(hash) => hash,
                Err(err) => {
                    debug!(task = %task.description, %err, "input unreadable, not caching");
                    return None;
                }
            },
            Fingerprint::Missing => return None,
        };
        inputs.push((path.clone(), hash));
    }
    let key = services.canonicalizer.key(&KeyMaterial {
        kind,
        command: task.command.clone(),
        environment: task.environment.clone(),
        working_directory: task.working_directory.clone(),
        inputs,
        dependencies: scan.map(|scan| scan.contribution),
    });
    Some((kind, key))
}

fn is_complete(services: &Services, task: &Task, entry: &CacheEntry) -> bool {
    task.outputs.iter().all(|output| {
        entry
            .output(&services.canonicalizer.output_name(output))
            .is_some()
    })
}

fn restore(services: &Services, task: &Task, entry: &CacheEntry) -> Result<(), FsError> {
    let fs = services.fingerprints.fs();
    for output in &task.outputs {
        let name = services.canonicalizer.output_name(output);
        if let Some(blob) = entry.output(&name) {
            fs.write(output, &blob.data)
                .map_err(|e| FsError::io(output, e))?;
        }
    }
    debug!(task = %task.description, outputs = task.outputs.len(), "restored outputs from cache");
    Ok(())
}

/// Reads the task's outputs into a cache entry. Directory outputs are not cached.
fn collect_entry(services: &Services, task: &Task, stderr: String) -> Option<CacheEntry> {
    let fs = services.fingerprints.fs();
    let mut outputs = Vec::with_capacity(task.outputs.len());
    for output in &task.outputs {
        match fs.stat(output) {
            Ok(Some(stat)) if !stat.is_dir => {}
            _ => {
                debug!(task = %task.description, output = %output.display(), "output not cacheable");
                return None;
            }
        }
        let data = match fs.read(output) {
            Ok(data) => data,
            Err(err) => {
                warn!(output = %output.display(), %err, "failed to read output for caching");
                return None;
            }
        };
        outputs.push(OutputBlob {
            name: services.canonicalizer.output_name(output),
            data,
        });
    }
    let diagnostics = if stderr.trim().is_empty() {
        Vec::new()
    } else {
        vec![stderr]
    };
    Some(CacheEntry {
        outputs,
        diagnostics,
    })
}
