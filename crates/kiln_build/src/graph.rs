//! The build-time task graph.
//!
//! Planned tasks occupy the first slots of the arena, so a plan `TaskId`
//! and its `NodeId` share an index. Module builds discovered by scans are
//! appended behind them and never move.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::{Arena, NodeId, TaskId};
use kiln_engine::{Cause, CauseGraph};
use kiln_modules::{ModuleKey, ScanRecord, SharingScope};
use kiln_plan::{BuildPlan, Task};

/// Where a node sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting for static dependencies.
    Pending,
    /// Its dependency scan is running.
    Scanning,
    /// Scanned; waiting for the module builds the scan requested.
    AwaitingModules,
    /// Queued for a decision.
    Ready,
    /// Being decided or executed on a worker.
    Running,
    /// Finished successfully, whether it ran or was up to date.
    Done,
    /// Failed.
    Failed,
    /// Not attempted because a dependency failed.
    Blocked,
    /// Not attempted because the build was cancelled.
    Cancelled,
}

impl NodeState {
    /// Whether the node will not change state again in this build.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Done | NodeState::Failed | NodeState::Blocked | NodeState::Cancelled
        )
    }
}

/// How a node entered the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOrigin {
    /// A task of the build plan.
    Planned(TaskId),
    /// A module build inserted by a dependency scan.
    Module {
        /// Scope the variant is shared in.
        scope: SharingScope,
        /// The module variant.
        key: ModuleKey,
        /// The consumer whose scan first requested it.
        requested_by: NodeId,
    },
}

/// One node of the build graph.
#[derive(Debug)]
pub struct GraphNode {
    /// The task to run.
    pub task: Arc<Task>,
    /// How the node entered the graph.
    pub origin: NodeOrigin,
    /// Lifecycle state.
    pub state: NodeState,
    /// Nodes that must finish first, static and dynamic.
    pub dependencies: Vec<NodeId>,
    /// Nodes waiting on this one.
    pub dependents: Vec<NodeId>,
    /// Inputs discovered by this node's scan, including module outputs.
    pub discovered: Vec<PathBuf>,
    /// This build's scan result.
    pub scan: Option<ScanRecord>,
    /// Why the node had to run, once decided.
    pub cause: Option<Cause>,
    /// Whether the node executed or restored its outputs in this build.
    pub ran: bool,
    unfinished: usize,
}

impl GraphNode {
    fn new(task: Arc<Task>, origin: NodeOrigin) -> Self {
        Self {
            task,
            origin,
            state: NodeState::Pending,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            discovered: Vec::new(),
            scan: None,
            cause: None,
            ran: false,
            unfinished: 0,
        }
    }

    /// The plan task behind this node, for planned nodes.
    pub fn task_id(&self) -> Option<TaskId> {
        match self.origin {
            NodeOrigin::Planned(id) => Some(id),
            NodeOrigin::Module { .. } => None,
        }
    }

    /// Whether every dependency has finished.
    pub fn is_unblocked(&self) -> bool {
        self.unfinished == 0
    }
}

/// What happened when edges were added to a waiting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expansion {
    /// Every new dependency already finished.
    Ready,
    /// The node waits for at least one dependency.
    Waiting,
    /// A new dependency already failed.
    Blocked,
}

/// Arena of build nodes with static and dynamic edges.
#[derive(Debug)]
pub struct BuildGraph {
    nodes: Arena<NodeId, GraphNode>,
    dynamic_outputs: HashMap<PathBuf, NodeId>,
}

impl BuildGraph {
    /// Creates one node per plan task, wired with the plan's static edges.
    pub fn from_plan(plan: &BuildPlan) -> Self {
        let mut nodes: Arena<NodeId, GraphNode> = Arena::new();
        for (id, task) in plan.tasks() {
            let node = nodes.alloc(GraphNode::new(Arc::new(task.clone()), NodeOrigin::Planned(id)));
            debug_assert_eq!(node.index(), id.index());
        }
        let mut graph = Self {
            nodes,
            dynamic_outputs: HashMap::new(),
        };
        for (id, _) in plan.tasks() {
            let node = Self::node_for_task(id);
            for &dep in plan.dependencies(id) {
                graph.link(Self::node_for_task(dep), node);
            }
        }
        graph
    }

    /// The node of a plan task.
    pub fn node_for_task(id: TaskId) -> NodeId {
        NodeId::from_raw(id.as_raw())
    }

    /// Returns a node.
    pub fn node(&self, id: NodeId) -> &GraphNode {
        self.nodes.get(id)
    }

    /// Returns a node mutably.
    pub fn node_mut(&mut self, id: NodeId) -> &mut GraphNode {
        self.nodes.get_mut(id)
    }

    /// All node IDs in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.ids()
    }

    /// All nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &GraphNode)> {
        self.nodes.iter()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The module build producing `path`, if a scan inserted one.
    pub fn dynamic_producer(&self, path: &Path) -> Option<NodeId> {
        self.dynamic_outputs.get(path).copied()
    }

    /// Inserts a module build depending on the builds of its imports.
    ///
    /// The new node starts `Pending`; check [`GraphNode::is_unblocked`] to
    /// see whether it can be queued right away.
    pub fn add_module_node(
        &mut self,
        task: Task,
        scope: SharingScope,
        key: ModuleKey,
        requested_by: NodeId,
        imports: &[NodeId],
    ) -> NodeId {
        let outputs = task.outputs.clone();
        let id = self.nodes.alloc(GraphNode::new(
            Arc::new(task),
            NodeOrigin::Module {
                scope,
                key,
                requested_by,
            },
        ));
        for output in outputs {
            self.dynamic_outputs.insert(output, id);
        }
        for &import in imports {
            self.link(import, id);
        }
        if imports.iter().any(|&dep| self.is_failed(dep)) {
            self.nodes.get_mut(id).state = NodeState::Blocked;
        }
        id
    }

    /// Adds all dynamic dependencies of a scanned node in one step.
    ///
    /// The node must not be queued again before this returns.
    pub fn expand(&mut self, node: NodeId, dependencies: &[NodeId], discovered: Vec<PathBuf>) -> Expansion {
        for &dep in dependencies {
            self.link(dep, node);
        }
        let blocked = dependencies.iter().any(|&dep| self.is_failed(dep));
        let entry = self.nodes.get_mut(node);
        entry.discovered = discovered;
        if blocked {
            entry.state = NodeState::Blocked;
            Expansion::Blocked
        } else if entry.unfinished == 0 {
            entry.state = NodeState::Ready;
            Expansion::Ready
        } else {
            entry.state = NodeState::AwaitingModules;
            Expansion::Waiting
        }
    }

    /// Marks a node done and returns dependents that became unblocked.
    pub fn complete(&mut self, node: NodeId) -> Vec<NodeId> {
        self.nodes.get_mut(node).state = NodeState::Done;
        let dependents = self.nodes.get(node).dependents.clone();
        let mut unblocked = Vec::new();
        for dependent in dependents {
            let entry = self.nodes.get_mut(dependent);
            entry.unfinished = entry.unfinished.saturating_sub(1);
            if entry.unfinished == 0
                && matches!(entry.state, NodeState::Pending | NodeState::AwaitingModules)
            {
                unblocked.push(dependent);
            }
        }
        unblocked
    }

    /// Marks a node failed and blocks everything downstream of it.
    ///
    /// Returns the newly blocked nodes.
    pub fn fail(&mut self, node: NodeId) -> Vec<NodeId> {
        self.nodes.get_mut(node).state = NodeState::Failed;
        self.block_dependents(node)
    }

    /// Marks a node blocked and blocks everything downstream of it.
    ///
    /// Returns the newly blocked dependents.
    pub fn block(&mut self, node: NodeId) -> Vec<NodeId> {
        self.nodes.get_mut(node).state = NodeState::Blocked;
        self.block_dependents(node)
    }

    fn block_dependents(&mut self, node: NodeId) -> Vec<NodeId> {
        let mut blocked = Vec::new();
        let mut pending = self.nodes.get(node).dependents.clone();
        while let Some(next) = pending.pop() {
            let entry = self.nodes.get_mut(next);
            if entry.state.is_terminal() || matches!(entry.state, NodeState::Running | NodeState::Scanning) {
                continue;
            }
            entry.state = NodeState::Blocked;
            blocked.push(next);
            pending.extend(entry.dependents.iter().copied());
        }
        blocked
    }

    fn link(&mut self, dependency: NodeId, dependent: NodeId) {
        if self.nodes.get(dependent).dependencies.contains(&dependency) {
            return;
        }
        let done = self.nodes.get(dependency).state == NodeState::Done;
        self.nodes.get_mut(dependency).dependents.push(dependent);
        let entry = self.nodes.get_mut(dependent);
        entry.dependencies.push(dependency);
        if !done {
            entry.unfinished += 1;
        }
    }

    fn is_failed(&self, node: NodeId) -> bool {
        matches!(self.nodes.get(node).state, NodeState::Failed | NodeState::Blocked)
    }
}

impl CauseGraph for BuildGraph {
    fn description(&self, node: NodeId) -> &str {
        &self.nodes.get(node).task.description
    }

    fn cause(&self, node: NodeId) -> Option<&Cause> {
        self.nodes.get(node).cause.as_ref()
    }

    fn dynamic_origin(&self, node: NodeId) -> Option<NodeId> {
        match self.nodes.get(node).origin {
            NodeOrigin::Module { requested_by, .. } => Some(requested_by),
            NodeOrigin::Planned(_) => None,
        }
    }
}
