//! Deduplicated module builds within a sharing scope.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use kiln_common::NodeId;
use kiln_config::{MissingDependencyLevel, ModulesSection, SharingMode};
use kiln_diagnostics::{Diagnostic, DiagnosticCode};
use kiln_plan::{BuildPlan, CacheKind, Task};

use crate::key::{ModuleKey, ResolvedModule};
use crate::report::ModuleReport;
use crate::variants::VariantTable;

/// Rule kind of module build tasks.
pub const PRECOMPILE_MODULE_RULE: &str = "PrecompileModule";

/// The boundary within which identical module keys share one build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SharingScope {
    /// Variants are private to one consumer target.
    Target(String),
    /// Variants are shared by the whole build.
    Workspace,
}

impl fmt::Display for SharingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharingScope::Target(name) => f.write_str(name),
            SharingScope::Workspace => f.write_str("workspace"),
        }
    }
}

/// Maps `(scope, key)` to the one graph node that builds it.
///
/// Owned by the scheduler's coordinator thread; workers never touch it.
#[derive(Debug)]
pub struct ModuleCoordinator {
    sharing: SharingMode,
    output_root: PathBuf,
    registry: HashMap<(SharingScope, ModuleKey), NodeId>,
    variants: VariantTable,
    report: ModuleReport,
}

impl ModuleCoordinator {
    /// Creates a coordinator, continuing from the variants of the previous build.
    pub fn new(build_root: &Path, modules: &ModulesSection, variants: VariantTable) -> Self {
        Self {
            sharing: modules.sharing,
            output_root: build_root.join(&modules.directory),
            registry: HashMap::new(),
            variants,
            report: ModuleReport::default(),
        }
    }

    /// The scope a consumer in `target` builds its modules in.
    ///
    /// Consumers without a target share the workspace scope.
    pub fn scope_for(&self, target: Option<&str>) -> SharingScope {
        match (self.sharing, target) {
            (SharingMode::Target, Some(target)) => SharingScope::Target(target.to_string()),
            _ => SharingScope::Workspace,
        }
    }

    /// Returns the node already building `key` in `scope`.
    pub fn node_for(&self, scope: &SharingScope, key: &ModuleKey) -> Option<NodeId> {
        self.registry.get(&(scope.clone(), key.clone())).copied()
    }

    /// Records the node building `key` in `scope` and registers the variant.
    pub fn register(&mut self, scope: &SharingScope, key: &ModuleKey, node: NodeId) {
        self.registry.insert((scope.clone(), key.clone()), node);
        let output = self.output_path(scope, key);
        self.variants.register(&scope.to_string(), key, output);
    }

    /// Number of distinct module builds registered in this build.
    pub fn registered(&self) -> usize {
        self.registry.len()
    }

    /// Where the variant's precompiled module is written.
    pub fn output_path(&self, scope: &SharingScope, key: &ModuleKey) -> PathBuf {
        self.output_root
            .join(scope.to_string())
            .join(format!("{}-{}.pcm", key.name, key.hash.short()))
    }

    /// Builds the task that precompiles `module` for consumers in `scope`.
    ///
    /// Environment and working directory are taken from the requesting consumer.
    pub fn module_task(
        &self,
        scope: &SharingScope,
        module: &ResolvedModule,
        consumer: &Task,
    ) -> Task {
        let output = self.output_path(scope, &module.key);
        let output_text = output.to_string_lossy().into_owned();

        let mut command = module.decl.arguments.clone();
        command.push(format!("-fmodule-name={}", module.key.name));
        command.push("-o".to_string());
        command.push(output_text.clone());

        let imported = module
            .imports
            .iter()
            .map(|import| self.output_path(scope, import));
        let mut task = Task::new([PRECOMPILE_MODULE_RULE.to_string(), output_text], command)
            .with_description(format!(
                "Compile module '{}' ({})",
                module.key.name,
                module.key.hash.short()
            ))
            .with_working_directory(consumer.working_directory.clone())
            .with_inputs(module.decl.defining_inputs.iter().cloned())
            .with_inputs(imported)
            .with_outputs([output])
            .cacheable(CacheKind::Compile);
        task.environment = consumer.environment.clone();
        if let SharingScope::Target(target) = scope {
            task = task.in_target(target.clone());
        }
        task
    }

    /// Variants known across builds.
    pub fn variants(&self) -> &VariantTable {
        &self.variants
    }

    /// Mutable access to the variant table.
    pub fn variants_mut(&mut self) -> &mut VariantTable {
        &mut self.variants
    }

    /// Variants built in this build.
    pub fn report(&self) -> &ModuleReport {
        &self.report
    }

    /// Mutable access to the report.
    pub fn report_mut(&mut self) -> &mut ModuleReport {
        &mut self.report
    }

    /// Consumes the coordinator, returning the table to persist.
    pub fn into_variants(self) -> VariantTable {
        self.variants
    }
}

/// Diagnoses a consumer importing a module from a target it does not depend on.
pub fn missing_dependency_diagnostic(
    plan: &BuildPlan,
    consumer: &Task,
    source: &Path,
    module: &str,
    level: MissingDependencyLevel,
) -> Option<Diagnostic> {
    let code = match level {
        MissingDependencyLevel::No => return None,
        MissingDependencyLevel::Yes => DiagnosticCode::MISSING_TARGET_DEPENDENCY,
        MissingDependencyLevel::Error => DiagnosticCode::MISSING_TARGET_DEPENDENCY_ERROR,
    };
    let consumer_target = consumer.target.as_deref()?;
    let provider = plan.target_defining_module(module)?;
    if provider.name == consumer_target || plan.target_depends_on(consumer_target, &provider.name) {
        return None;
    }
    let message = format!(
        "'{consumer_target}' is missing a dependency on '{}' because dependency scan of '{}' discovered a dependency on '{module}'",
        provider.name,
        source.display()
    );
    let diagnostic = match level {
        MissingDependencyLevel::Error => Diagnostic::error(code, message),
        _ => Diagnostic::warning(code, message),
    };
    Some(
        diagnostic
            .with_subject(consumer.description.clone())
            .with_help(format!(
                "add '{}' to the dependencies of '{consumer_target}'",
                provider.name
            )),
    )
}
