//! One build from start to finish.
//!
//! A session opens the build state store and the compilation cache, runs the
//! scheduler, and then performs the end-of-build work: pruning, metrics,
//! module variant retirement and the final flush of the state store.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use kiln_cache::{
    CacheKey, CacheMetrics, CompilationCache, KeyCanonicalizer, PathRemapper, PruneSummary,
};
use kiln_common::paths::absolutize;
use kiln_common::NodeId;
use kiln_config::resolve::ENV_CACHE_ROOT;
use kiln_config::{resolve_cache_root, resolve_size_limit, BuildConfig, SizeLimit};
use kiln_diagnostics::{Diagnostic, DiagnosticCode, DiagnosticSink};
use kiln_engine::{build_backtrace, Backtrace, BuildStateStore, SignatureComputer};
use kiln_fs::{FileSystem, FingerprintStore, LocalFs};
use kiln_modules::{DependencyScanner, ModuleCoordinator, ModuleKey, RetiredVariant};
use kiln_plan::BuildPlan;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::BuildError;
use crate::events::EventLog;
use crate::executor::Executor;
use crate::graph::{BuildGraph, NodeOrigin, NodeState};
use crate::report::{BuildReport, TaskOutcome, TaskReport};
use crate::scheduler::{Schedule, Scheduler, SchedulerOptions, Services};

/// Runs builds of plans rooted in one workspace.
pub struct BuildSession {
    config: BuildConfig,
    workspace_root: PathBuf,
    build_root: PathBuf,
    fs: Arc<dyn FileSystem>,
    cancel: CancellationToken,
    env_cache_root: Option<PathBuf>,
}

impl BuildSession {
    /// Creates a session. Relative configured paths resolve against `workspace_root`.
    ///
    /// `$KILN_CACHE_ROOT` is read here, once.
    pub fn new(workspace_root: impl Into<PathBuf>, config: BuildConfig) -> Self {
        let workspace_root = workspace_root.into();
        let build_root = absolutize(&workspace_root, &config.build.root);
        Self {
            config,
            workspace_root,
            build_root,
            fs: Arc::new(LocalFs),
            cancel: CancellationToken::new(),
            env_cache_root: std::env::var_os(ENV_CACHE_ROOT).map(PathBuf::from),
        }
    }

    /// Replaces the filesystem used for fingerprints, cached outputs and reports.
    pub fn with_filesystem(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// The configuration in effect.
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// The absolute build root.
    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    /// A token that cancels builds of this session.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Builds `plan`, running tasks through `executor`.
    ///
    /// Task failures are reported in the returned [`BuildReport`]; an `Err`
    /// means the build could not start or its results could not be saved.
    pub fn build(&self, plan: &BuildPlan, executor: Arc<dyn Executor>) -> Result<BuildReport, BuildError> {
        let started = Instant::now();
        let mut store = BuildStateStore::open(&self.build_root)?;
        let diagnostics = Arc::new(DiagnosticSink::new());
        if let Some(reason) = store.load_warning() {
            diagnostics.emit(
                Diagnostic::warning(
                    DiagnosticCode::STATE_STORE,
                    format!("build state was discarded: {reason}"),
                )
                .with_subject(store.path().display().to_string())
                .with_note("every task will run"),
            );
        }

        let cache = self.open_cache(&diagnostics);
        let cache_lost = self.config.cache.enabled
            && match (store.cache_instance(), cache.as_deref()) {
                (None, _) => false,
                (Some(previous), Some(cache)) => previous != cache.instance_id(),
                (Some(_), None) => true,
            };
        if cache_lost {
            warn!("compilation cache was lost since the last build; cacheable tasks will run");
        }

        let fingerprints = Arc::new(FingerprintStore::new(
            Arc::clone(&self.fs),
            self.config.build.fingerprint,
        ));
        let remapper = self.remapper();
        let metrics = Arc::new(CacheMetrics::new());
        let events = Arc::new(EventLog::new());
        let services = Arc::new(Services {
            executor,
            fingerprints: Arc::clone(&fingerprints),
            signatures: SignatureComputer::new(Arc::clone(&fingerprints)),
            scanner: DependencyScanner::new(Arc::clone(&fingerprints), remapper.clone()),
            cache: cache.clone(),
            canonicalizer: KeyCanonicalizer::new(remapper, self.config.cache.fold_working_directory),
            metrics: Arc::clone(&metrics),
            events: Arc::clone(&events),
            diagnostics: Arc::clone(&diagnostics),
            cancel: self.cancel.clone(),
            cache_lost,
            verify: self.config.cache.verify,
            remarks: self.config.cache.diagnostic_remarks,
        });

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.build.jobs.unwrap_or(0))
            .thread_name(|i| format!("kiln-worker-{i}"))
            .build()
            .map_err(|e| BuildError::WorkerPool {
                reason: e.to_string(),
            })?;

        let mut modules =
            ModuleCoordinator::new(&self.build_root, &self.config.modules, store.take_variants());
        let options = SchedulerOptions {
            modules: self.config.modules.enabled,
            missing_dependencies: self.config.build.diagnose_missing_target_dependencies,
        };
        let Schedule { graph, outcomes } =
            Scheduler::new(plan, options, services, &mut store, &mut modules).run(&pool);
        drop(pool);

        let cancelled = self.cancel.is_cancelled();
        let complete = !cancelled && graph.iter().all(|(_, node)| node.state == NodeState::Done);

        let mut retired_variants = Vec::new();
        if complete {
            let live = graph.iter().map(|(_, node)| node.task.rule_info.clone()).collect();
            store.retain_rules(&live);
            retired_variants = self.retire_variants(&graph, &mut modules)?;
        }

        let mut prune = None;
        if let Some(cache) = &cache {
            if let Some(summary) = metrics.summary() {
                info!(%summary, "compilation cache");
                diagnostics.emit(Diagnostic::note(DiagnosticCode::CACHE_SUMMARY, summary));
            }
            if !cancelled {
                prune = self.prune(cache, &store, &diagnostics)?;
            }
        }

        if let Some(path) = &self.config.build.metrics_path {
            let path = absolutize(&self.workspace_root, path);
            metrics
                .write_report(&path)
                .map_err(|e| BuildError::report(&path, e))?;
            debug!(path = %path.display(), "wrote cache metrics");
        }
        if let Some(dir) = &self.config.modules.report_dir {
            let dir = absolutize(&self.workspace_root, dir);
            let path = modules.report().write(&dir, self.fs.as_ref())?;
            debug!(path = %path.display(), "wrote precompiled modules report");
        }

        let discarded = matches!(resolve_size_limit(&self.config.cache)?, SizeLimit::Discarded);
        let instance = cache
            .as_deref()
            .filter(|_| !discarded)
            .map(|cache| cache.instance_id().to_string());
        store.set_cache_instance(instance);
        store.set_variants(modules.into_variants());
        store.flush()?;

        let tasks = task_reports(&graph, &outcomes);
        let count = |outcome| tasks.iter().filter(|t| t.outcome == outcome).count();
        info!(
            executed = count(TaskOutcome::Executed),
            restored = count(TaskOutcome::Restored),
            up_to_date = count(TaskOutcome::UpToDate),
            failed = count(TaskOutcome::Failed),
            blocked = count(TaskOutcome::Blocked),
            cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "build finished"
        );

        Ok(BuildReport {
            tasks,
            events: events.take(),
            diagnostics: diagnostics.take_all(),
            metrics: metrics.report(),
            prune,
            retired_variants,
            cancelled,
        })
    }

    fn open_cache(&self, diagnostics: &DiagnosticSink) -> Option<Arc<CompilationCache>> {
        if !self.config.cache.enabled {
            return None;
        }
        let root = resolve_cache_root(&self.config.cache, &self.build_root, self.env_cache_root.clone());
        let path = absolutize(&self.workspace_root, &root.path);
        match CompilationCache::open(&path) {
            Ok(cache) => {
                debug!(root = %path.display(), source = ?root.source, "opened compilation cache");
                Some(Arc::new(cache))
            }
            Err(err) => {
                warn!(root = %path.display(), %err, "compilation cache unavailable, continuing without it");
                diagnostics.emit(
                    Diagnostic::warning(DiagnosticCode::CACHE_UNAVAILABLE, err.to_string())
                        .with_subject(path.display().to_string())
                        .with_note("every cacheable task will run"),
                );
                None
            }
        }
    }

    /// The remapper for cache keys. The workspace root stands in for an unset `remap.workspace`.
    fn remapper(&self) -> PathRemapper {
        let mut remap = self.config.remap.clone();
        if remap.workspace.is_none() {
            remap.workspace = Some(self.workspace_root.clone());
        }
        PathRemapper::from_config(&remap, &self.build_root)
    }

    fn retire_variants(
        &self,
        graph: &BuildGraph,
        modules: &mut ModuleCoordinator,
    ) -> Result<Vec<RetiredVariant>, BuildError> {
        let mut referenced: HashSet<(String, ModuleKey)> = HashSet::new();
        for (_, node) in graph.iter() {
            let (NodeOrigin::Planned(_), Some(scan)) = (&node.origin, &node.scan) else {
                continue;
            };
            let scope = modules.scope_for(node.task.target.as_deref()).to_string();
            referenced.extend(scan.module_keys().map(|key| (scope.clone(), key.clone())));
        }
        let retired = modules
            .variants_mut()
            .retire_unreferenced(&referenced, self.fs.as_ref())?;
        for variant in &retired {
            debug!(scope = %variant.scope, module = %variant.key, "retired module variant");
        }
        Ok(retired)
    }

    /// Prunes the cache to its size limit.
    ///
    /// Only entries recorded in this build root's state store count as
    /// referenced. Other build roots sharing the cache are protected by
    /// recency alone, since their recent hits refresh entry times.
    fn prune(
        &self,
        cache: &CompilationCache,
        store: &BuildStateStore,
        diagnostics: &DiagnosticSink,
    ) -> Result<Option<PruneSummary>, BuildError> {
        let limit = resolve_size_limit(&self.config.cache)?;
        if limit == SizeLimit::Discarded {
            if let Err(err) = cache.discard() {
                warn!(%err, "failed to discard compilation cache");
            }
            return Ok(None);
        }
        let Some(limit_bytes) = limit.limit_bytes(self.fs.available_space(cache.root())) else {
            return Ok(None);
        };
        let referenced: HashSet<CacheKey> = store
            .records()
            .filter_map(|(_, record)| record.cache_key)
            .collect();
        let summary = match cache.prune(limit_bytes, &referenced) {
            Ok(summary) => summary,
            Err(err) => {
                warn!(%err, "pruning the compilation cache failed");
                return Ok(None);
            }
        };
        if self.config.cache.diagnostic_remarks {
            if let Some(remark) = summary.remark() {
                diagnostics.emit(Diagnostic::note(DiagnosticCode::CACHE_PRUNE, remark));
            }
        }
        if summary.still_over_limit() {
            diagnostics.emit(
                Diagnostic::warning(
                    DiagnosticCode::CACHE_OVER_LIMIT,
                    format!(
                        "compilation cache is still {} bytes after pruning, above its limit of {} bytes",
                        summary.size_after, summary.limit
                    ),
                )
                .with_note(format!(
                    "{} entries are referenced by up-to-date tasks and {} are in use",
                    summary.kept_referenced, summary.skipped_locked
                )),
            );
        }
        Ok(Some(summary))
    }
}

fn task_reports(
    graph: &BuildGraph,
    outcomes: &HashMap<NodeId, TaskOutcome>,
) -> Vec<TaskReport> {
    graph
        .iter()
        .map(|(id, node)| {
            let backtrace = if node.cause.is_some() {
                build_backtrace(graph, id)
            } else {
                Backtrace::default()
            };
            if !backtrace.is_empty() {
                debug!(task = %node.task.description, "backtrace:\n{backtrace}");
            }
            TaskReport {
                rule_info: node.task.rule_info.clone(),
                description: node.task.description.clone(),
                outcome: outcomes
                    .get(&id)
                    .copied()
                    .unwrap_or(TaskOutcome::Cancelled),
                backtrace,
                dynamic: matches!(node.origin, NodeOrigin::Module { .. }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecOutcome, ExecRequest};
    use kiln_engine::STATE_FILE_NAME;
    use kiln_plan::{CacheKind, Task};
    use tracing_test::traced_test;

    /// Writes a fixed payload to every output.
    struct Touch;

    impl Executor for Touch {
        fn execute(&self, request: &ExecRequest<'_>) -> ExecOutcome {
            for output in &request.task.outputs {
                if let Err(err) = std::fs::write(output, b"payload") {
                    return ExecOutcome::failure(1, err.to_string());
                }
            }
            ExecOutcome::success()
        }
    }

    fn session(root: &Path, cache: PathBuf) -> BuildSession {
        let mut config = BuildConfig::default();
        config.cache.path = Some(cache);
        BuildSession::new(root, config)
    }

    fn plan(root: &Path) -> BuildPlan {
        let task = Task::new(["Gen", "build/out.txt"], vec!["gen".to_string()])
            .with_description("Generate out.txt")
            .with_working_directory(root)
            .with_outputs(["build/out.txt"])
            .cacheable(CacheKind::Generic);
        BuildPlan::new(vec![task]).unwrap()
    }

    #[test]
    #[traced_test]
    fn lost_cache_is_logged_and_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        session(dir.path(), cache.clone())
            .build(&plan(dir.path()), Arc::new(Touch))
            .unwrap();
        std::fs::remove_dir_all(&cache).unwrap();

        let report = session(dir.path(), cache)
            .build(&plan(dir.path()), Arc::new(Touch))
            .unwrap();
        assert_eq!(report.outcome("Generate out.txt"), Some(TaskOutcome::Executed));
        assert!(logs_contain("compilation cache was lost"));
    }

    #[test]
    fn unreadable_state_is_discarded_with_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let build_root = dir.path().join("build");
        std::fs::create_dir_all(&build_root).unwrap();
        std::fs::write(build_root.join(STATE_FILE_NAME), b"not a state file").unwrap();

        let report = session(dir.path(), dir.path().join("cache"))
            .build(&plan(dir.path()), Arc::new(Touch))
            .unwrap();
        assert!(report.succeeded());
        let warning = report
            .diagnostics
            .iter()
            .find(|diag| diag.code == DiagnosticCode::STATE_STORE)
            .unwrap();
        assert!(warning.message.starts_with("build state was discarded: "));
    }

    #[test]
    fn unusable_cache_root_degrades_to_uncached_builds() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let report = session(dir.path(), blocker.join("cache"))
            .build(&plan(dir.path()), Arc::new(Touch))
            .unwrap();
        assert_eq!(report.outcome("Generate out.txt"), Some(TaskOutcome::Executed));
        assert!(report.metrics.tasks.is_empty());
        assert!(report
            .diagnostics
            .iter()
            .any(|diag| diag.code == DiagnosticCode::CACHE_UNAVAILABLE));
    }

    #[test]
    fn relative_cache_path_resolves_against_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        session(dir.path(), PathBuf::from("shared-cache"))
            .build(&plan(dir.path()), Arc::new(Touch))
            .unwrap();
        assert!(dir.path().join("shared-cache").join("generic").is_dir());
    }
}
