//! Plan validation and producer/consumer resolution.

use crate::error::PlanError;
use crate::task::Task;
use kiln_common::paths::{absolutize, subtrees_overlap};
use kiln_common::{Arena, TaskId};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// A target: a named group of tasks with declared dependencies on other targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInfo {
    /// Target name.
    pub name: String,
    /// Names of targets this target depends on directly.
    pub dependencies: Vec<String>,
    /// Modules whose definitions this target provides.
    pub defines_modules: Vec<String>,
}

impl TargetInfo {
    /// Creates a target with no dependencies and no modules.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a dependency on another target.
    pub fn depends_on(mut self, target: impl Into<String>) -> Self {
        self.dependencies.push(target.into());
        self
    }

    /// Declares a module defined by this target.
    pub fn defines_module(mut self, module: impl Into<String>) -> Self {
        self.defines_modules.push(module.into());
        self
    }
}

/// The task a consumer sees as responsible for an input's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    /// The task that created the path.
    Produced(TaskId),
    /// The latest task that modified the path in place.
    Mutated(TaskId),
}

impl Writer {
    /// Returns the writing task.
    pub fn task(self) -> TaskId {
        match self {
            Writer::Produced(id) | Writer::Mutated(id) => id,
        }
    }
}

/// A validated, immutable build plan.
#[derive(Debug)]
pub struct BuildPlan {
    tasks: Arena<TaskId, Task>,
    targets: BTreeMap<String, TargetInfo>,
    /// Per output path: the creating task first, then mutators in plan order.
    writers: HashMap<PathBuf, Vec<TaskId>>,
    dependencies: Vec<Vec<TaskId>>,
    dependents: Vec<Vec<TaskId>>,
    order: Vec<TaskId>,
}

impl BuildPlan {
    /// Validates tasks and resolves their static dependency edges.
    ///
    /// Relative paths are resolved against each task's working directory.
    /// Fails on duplicate outputs, duplicate rule info, and dependency cycles.
    pub fn new(tasks: Vec<Task>) -> Result<Self, PlanError> {
        let mut arena = Arena::new();
        let mut identities = HashSet::new();
        for (index, mut task) in tasks.into_iter().enumerate() {
            if task.rule_info.is_empty() {
                return Err(PlanError::InvalidTask {
                    index,
                    reason: "empty rule info".to_string(),
                });
            }
            if !identities.insert(task.rule_info.clone()) {
                return Err(PlanError::InvalidTask {
                    index,
                    reason: format!("duplicate rule info '{}'", task.rule_info),
                });
            }
            normalize_task_paths(&mut task);
            arena.alloc(task);
        }

        let writers = collect_writers(&arena)?;
        let mut plan = Self {
            dependencies: vec![Vec::new(); arena.len()],
            dependents: vec![Vec::new(); arena.len()],
            tasks: arena,
            targets: BTreeMap::new(),
            writers,
            order: Vec::new(),
        };
        plan.resolve_edges();
        plan.order = plan.check_cycles()?;
        Ok(plan)
    }

    /// Attaches target metadata.
    pub fn with_targets(mut self, targets: impl IntoIterator<Item = TargetInfo>) -> Self {
        for target in targets {
            self.targets.insert(target.name.clone(), target);
        }
        self
    }

    /// Returns the task with the given ID.
    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id]
    }

    /// Iterates over all tasks in plan order.
    pub fn tasks(&self) -> impl Iterator<Item = (TaskId, &Task)> {
        self.tasks.iter()
    }

    /// Returns the number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if the plan has no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks that must finish before `id` may be decided.
    pub fn dependencies(&self, id: TaskId) -> &[TaskId] {
        &self.dependencies[id.index()]
    }

    /// Tasks waiting on `id`.
    pub fn dependents(&self, id: TaskId) -> &[TaskId] {
        &self.dependents[id.index()]
    }

    /// All tasks in a dependency-respecting order.
    pub fn topological_order(&self) -> &[TaskId] {
        &self.order
    }

    /// Returns the task responsible for `input`'s state as seen by `consumer`.
    ///
    /// Inputs nested inside a produced directory resolve to that directory's writer.
    /// A mutator sees the writer before it in the chain; everyone else sees the last one.
    pub fn writer_for(&self, consumer: TaskId, input: &Path) -> Option<Writer> {
        let is_mutator = self.tasks[consumer].mutates_shared_outputs();
        for dir in input.ancestors() {
            let Some(chain) = self.writers.get(dir) else {
                continue;
            };
            let Some(&last) = chain.last() else {
                continue;
            };
            let writer = match chain.iter().position(|id| *id == consumer) {
                Some(0) => continue,
                Some(pos) => chain[pos - 1],
                None if is_mutator => chain
                    .iter()
                    .rev()
                    .find(|id| **id < consumer)
                    .copied()
                    .unwrap_or(chain[0]),
                None => last,
            };
            let mutated = self.tasks[writer]
                .capabilities
                .mutates
                .iter()
                .any(|path| input.starts_with(path));
            return Some(if mutated {
                Writer::Mutated(writer)
            } else {
                Writer::Produced(writer)
            });
        }
        None
    }

    /// Returns the last task writing `path`, if any.
    pub fn producer_of(&self, path: &Path) -> Option<TaskId> {
        self.writers.get(path).and_then(|chain| chain.last().copied())
    }

    /// Returns target metadata by name.
    pub fn target(&self, name: &str) -> Option<&TargetInfo> {
        self.targets.get(name)
    }

    /// Returns the target that defines `module`, if any.
    pub fn target_defining_module(&self, module: &str) -> Option<&TargetInfo> {
        self.targets
            .values()
            .find(|t| t.defines_modules.iter().any(|m| m == module))
    }

    /// Returns `true` if `from` depends on `to`, directly or transitively.
    pub fn target_depends_on(&self, from: &str, to: &str) -> bool {
        let mut pending = vec![from];
        let mut seen = HashSet::new();
        while let Some(name) = pending.pop() {
            if !seen.insert(name) {
                continue;
            }
            let Some(target) = self.targets.get(name) else {
                continue;
            };
            for dep in &target.dependencies {
                if dep == to {
                    return true;
                }
                pending.push(dep);
            }
        }
        false
    }

    fn resolve_edges(&mut self) {
        let ids: Vec<TaskId> = self.tasks.ids().collect();
        for &id in &ids {
            let mut deps: Vec<TaskId> = self.tasks[id]
                .inputs
                .iter()
                .filter_map(|input| self.writer_for(id, input))
                .map(Writer::task)
                .collect();

            // Mutators of overlapping subtrees run in plan order.
            let mutated = &self.tasks[id].capabilities.mutates;
            if !mutated.is_empty() {
                for &earlier in ids.iter().take_while(|other| **other < id) {
                    let overlaps = self.tasks[earlier].capabilities.mutates.iter().any(|a| {
                        mutated.iter().any(|b| subtrees_overlap(a, b))
                    });
                    if overlaps {
                        deps.push(earlier);
                    }
                }
            }

            deps.retain(|dep| *dep != id);
            deps.sort();
            deps.dedup();
            for dep in &deps {
                self.dependents[dep.index()].push(id);
            }
            self.dependencies[id.index()] = deps;
        }
    }

    fn check_cycles(&self) -> Result<Vec<TaskId>, PlanError> {
        let mut graph: DiGraph<TaskId, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = self.tasks.ids().map(|id| graph.add_node(id)).collect();
        for (id, deps) in self.dependencies.iter().enumerate() {
            for dep in deps {
                graph.add_edge(nodes[dep.index()], nodes[id], ());
            }
        }
        petgraph::algo::toposort(&graph, None)
            .map(|order| order.into_iter().map(|n| graph[n]).collect())
            .map_err(|cycle| PlanError::DependencyCycle {
                task: self.tasks[graph[cycle.node_id()]].description.clone(),
            })
    }
}

fn normalize_task_paths(task: &mut Task) {
    let base = task.working_directory.clone();
    let fix = |paths: &mut Vec<PathBuf>| {
        for path in paths.iter_mut() {
            *path = absolutize(&base, path);
        }
    };
    fix(&mut task.inputs);
    fix(&mut task.outputs);
    fix(&mut task.capabilities.mutates);
    if let Some(scan) = task.capabilities.scan.as_mut() {
        scan.source = absolutize(&base, &scan.source);
    }
}

fn collect_writers(tasks: &Arena<TaskId, Task>) -> Result<HashMap<PathBuf, Vec<TaskId>>, PlanError> {
    let mut creators: HashMap<&Path, Vec<TaskId>> = HashMap::new();
    let mut mutators: HashMap<&Path, Vec<TaskId>> = HashMap::new();
    for (id, task) in tasks.iter() {
        for output in &task.outputs {
            if task.capabilities.mutates.contains(output) {
                mutators.entry(output.as_path()).or_default().push(id);
            } else {
                creators.entry(output.as_path()).or_default().push(id);
            }
        }
    }

    let mut writers = HashMap::new();
    let mut paths: Vec<&Path> = creators.keys().chain(mutators.keys()).copied().collect();
    paths.sort();
    paths.dedup();
    for path in paths {
        let created = creators.remove(path).unwrap_or_default();
        if let [first, second, ..] = created.as_slice() {
            return Err(PlanError::DuplicateOutput {
                path: path.to_path_buf(),
                first: tasks[*first].description.clone(),
                second: tasks[*second].description.clone(),
            });
        }
        let mut chain = created;
        chain.extend(mutators.remove(path).unwrap_or_default());
        writers.insert(path.to_path_buf(), chain);
    }
    Ok(writers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(kind: &str, name: &str) -> Task {
        Task::new([kind, name], vec!["tool".to_string()])
    }

    fn id(raw: u32) -> TaskId {
        TaskId::from_raw(raw)
    }

    #[test]
    fn producer_edges_from_paths() {
        let plan = BuildPlan::new(vec![
            task("CompileC", "a.o").with_inputs(["/src/a.c"]).with_outputs(["/out/a.o"]),
            task("Ld", "app").with_inputs(["/out/a.o"]).with_outputs(["/out/app"]),
        ])
        .unwrap();
        assert_eq!(plan.dependencies(id(1)), &[id(0)]);
        assert_eq!(plan.dependents(id(0)), &[id(1)]);
        assert_eq!(plan.producer_of(Path::new("/out/a.o")), Some(id(0)));
        assert_eq!(plan.topological_order(), &[id(0), id(1)]);
    }

    #[test]
    fn duplicate_output_is_fatal() {
        let err = BuildPlan::new(vec![
            task("CompileC", "a").with_description("Compile a.c").with_outputs(["/out/x.o"]),
            task("CompileC", "b").with_description("Compile b.c").with_outputs(["/out/x.o"]),
        ])
        .unwrap_err();
        match err {
            PlanError::DuplicateOutput { path, first, second } => {
                assert_eq!(path, PathBuf::from("/out/x.o"));
                assert_eq!(first, "Compile a.c");
                assert_eq!(second, "Compile b.c");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_rule_info_is_invalid() {
        let err = BuildPlan::new(vec![task("Ld", "app"), task("Ld", "app")]).unwrap_err();
        assert!(matches!(err, PlanError::InvalidTask { index: 1, .. }));
    }

    #[test]
    fn mutators_chain_in_plan_order() {
        let plan = BuildPlan::new(vec![
            task("Copy", "App").with_outputs(["/out/App"]),
            task("Validate", "App").mutates(["/out/App"]),
            task("CodeSign", "App").mutates(["/out/App"]),
            task("Register", "App").with_inputs(["/out/App"]),
        ])
        .unwrap();
        assert_eq!(
            plan.writer_for(id(1), Path::new("/out/App")),
            Some(Writer::Produced(id(0)))
        );
        assert_eq!(
            plan.writer_for(id(2), Path::new("/out/App")),
            Some(Writer::Mutated(id(1)))
        );
        assert_eq!(
            plan.writer_for(id(3), Path::new("/out/App")),
            Some(Writer::Mutated(id(2)))
        );
        assert_eq!(plan.dependencies(id(2)), &[id(1)]);
        assert_eq!(plan.dependencies(id(3)), &[id(2)]);
    }

    #[test]
    fn overlapping_mutators_are_serialized() {
        let plan = BuildPlan::new(vec![
            task("Copy", "App").with_outputs(["/out/App"]),
            task("Strip", "bin").mutates(["/out/App/bin"]),
            task("CodeSign", "App").mutates(["/out/App"]),
        ])
        .unwrap();
        assert!(plan.dependencies(id(2)).contains(&id(1)));
        // The nested mutated path resolves to the directory's writer.
        assert_eq!(
            plan.writer_for(id(1), Path::new("/out/App/bin")),
            Some(Writer::Produced(id(0)))
        );
    }

    #[test]
    fn nested_input_resolves_to_directory_producer() {
        let plan = BuildPlan::new(vec![
            task("Copy", "Headers").with_outputs(["/out/Headers"]),
            task("CompileC", "a.o").with_inputs(["/out/Headers/a.h"]),
        ])
        .unwrap();
        assert_eq!(plan.dependencies(id(1)), &[id(0)]);
    }

    #[test]
    fn relative_paths_resolve_against_working_directory() {
        let plan = BuildPlan::new(vec![task("CompileC", "a.o")
            .with_working_directory("/proj")
            .with_inputs(["src/../a.c"])
            .with_outputs(["build/a.o"])
            .scans("a.c")])
        .unwrap();
        let t = plan.task(id(0));
        assert_eq!(t.inputs, vec![PathBuf::from("/proj/a.c")]);
        assert_eq!(t.outputs, vec![PathBuf::from("/proj/build/a.o")]);
        assert_eq!(t.scan_spec().unwrap().source, PathBuf::from("/proj/a.c"));
    }

    #[test]
    fn cycle_is_detected() {
        let err = BuildPlan::new(vec![
            task("A", "a").with_inputs(["/b"]).with_outputs(["/a"]),
            task("B", "b").with_inputs(["/a"]).with_outputs(["/b"]),
        ])
        .unwrap_err();
        assert!(matches!(err, PlanError::DependencyCycle { .. }));
    }

    #[test]
    fn target_dependencies_are_transitive() {
        let plan = BuildPlan::new(vec![]).unwrap().with_targets([
            TargetInfo::new("App").depends_on("Core"),
            TargetInfo::new("Core").depends_on("Base"),
            TargetInfo::new("Base").defines_module("BaseKit"),
        ]);
        assert!(plan.target_depends_on("App", "Base"));
        assert!(!plan.target_depends_on("Base", "App"));
        assert_eq!(plan.target_defining_module("BaseKit").unwrap().name, "Base");
        assert!(plan.is_empty());
    }
}
