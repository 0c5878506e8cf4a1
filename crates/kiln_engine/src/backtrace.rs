//! Backtraces: the chain of causes behind a task running.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use kiln_common::NodeId;

use crate::decision::{Cause, InputChange};

/// Category of one backtrace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BacktraceCategory {
    /// The task had no previous record.
    RuleNeverBuilt,
    /// Some recorded value was invalid: outputs, a file, a lost cache.
    RuleHadInvalidValue,
    /// The task's command changed.
    RuleSignatureChanged,
    /// An input was rebuilt or changed.
    RuleInputRebuilt,
    /// The task was inserted into the graph at runtime.
    DynamicTaskRegistration,
    /// What requested the runtime insertion.
    DynamicTaskRequest,
}

impl BacktraceCategory {
    /// The name used in rendered backtraces.
    pub fn as_str(self) -> &'static str {
        match self {
            BacktraceCategory::RuleNeverBuilt => "ruleNeverBuilt",
            BacktraceCategory::RuleHadInvalidValue => "ruleHadInvalidValue",
            BacktraceCategory::RuleSignatureChanged => "ruleSignatureChanged",
            BacktraceCategory::RuleInputRebuilt => "ruleInputRebuilt",
            BacktraceCategory::DynamicTaskRegistration => "dynamicTaskRegistration",
            BacktraceCategory::DynamicTaskRequest => "dynamicTaskRequest",
        }
    }
}

impl fmt::Display for BacktraceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an entry refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BacktraceSubject {
    /// A graph node.
    Task(NodeId),
    /// A file or directory.
    File(PathBuf),
}

/// One link in a backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktraceEntry {
    /// Category.
    pub category: BacktraceCategory,
    /// Human-readable description.
    pub description: String,
    /// The referenced task or file.
    pub subject: Option<BacktraceSubject>,
}

impl fmt::Display for BacktraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<category='{}' description='{}'>",
            self.category, self.description
        )
    }
}

/// Causes behind a task running, most proximate first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    entries: Vec<BacktraceEntry>,
}

impl Backtrace {
    /// The entries in order.
    pub fn entries(&self) -> &[BacktraceEntry] {
        &self.entries
    }

    /// Categories of the entries in order.
    pub fn categories(&self) -> Vec<BacktraceCategory> {
        self.entries.iter().map(|e| e.category).collect()
    }

    /// Returns `true` for the backtrace of an up-to-date task.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, category: BacktraceCategory, description: String, subject: Option<BacktraceSubject>) {
        self.entries.push(BacktraceEntry {
            category,
            description,
            subject,
        });
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

/// The view of the build graph a backtrace walk needs.
pub trait CauseGraph {
    /// Execution description of a node's task.
    fn description(&self, node: NodeId) -> &str;

    /// The cause recorded when the node was decided, if it had to run.
    fn cause(&self, node: NodeId) -> Option<&Cause>;

    /// The consumer whose scan inserted the node, for runtime-inserted nodes.
    fn dynamic_origin(&self, node: NodeId) -> Option<NodeId>;
}

/// Walks causes backward from `node`.
///
/// Each producer is visited at most once, so the walk terminates even if
/// recorded causes form a loop.
pub fn build_backtrace(graph: &dyn CauseGraph, node: NodeId) -> Backtrace {
    use BacktraceCategory::*;

    let mut backtrace = Backtrace::default();
    let mut visited = HashSet::new();
    let mut current = Some(node);
    while let Some(node) = current.take() {
        if !visited.insert(node) {
            break;
        }
        let Some(cause) = graph.cause(node) else {
            break;
        };
        let task = graph.description(node);

        if let Some(origin) = graph.dynamic_origin(node) {
            backtrace.push(DynamicTaskRegistration, String::new(), Some(BacktraceSubject::Task(node)));
            backtrace.push(
                DynamicTaskRequest,
                format!(
                    "task was scheduled by the dependency scan of '{}'",
                    graph.description(origin)
                ),
                Some(BacktraceSubject::Task(origin)),
            );
        }

        let this = Some(BacktraceSubject::Task(node));
        match cause {
            Cause::NeverBuilt => {
                backtrace.push(RuleNeverBuilt, format!("'{task}' had never run"), this);
            }
            Cause::AlwaysOutOfDate => backtrace.push(
                RuleHadInvalidValue,
                format!("'{task}' is configured to run in every incremental build"),
                this,
            ),
            Cause::OutputsStale => backtrace.push(
                RuleHadInvalidValue,
                format!("'{task}' did not have up-to-date outputs"),
                this,
            ),
            Cause::CacheLost => backtrace.push(
                RuleHadInvalidValue,
                format!("compilation cache for '{task}' is unavailable"),
                this,
            ),
            Cause::SignatureChanged => {
                backtrace.push(RuleSignatureChanged, format!("signature of '{task}' changed"), this);
            }
            Cause::InputChanged { input, change } => {
                backtrace.push(RuleInputRebuilt, format!("an input of '{task}' changed"), this);
                let file = Some(BacktraceSubject::File(input.clone()));
                match change {
                    InputChange::SourceFile => backtrace.push(
                        RuleHadInvalidValue,
                        format!("file '{}' changed", input.display()),
                        file,
                    ),
                    InputChange::Directory => backtrace.push(
                        RuleHadInvalidValue,
                        format!("contents of '{}' changed", input.display()),
                        file,
                    ),
                    InputChange::ProducerRan(producer) => {
                        backtrace.push(
                            RuleInputRebuilt,
                            format!("the producer of file '{}' ran", input.display()),
                            file,
                        );
                        current = Some(*producer);
                    }
                    InputChange::Mutated { writer, paths } => {
                        backtrace.push(
                            RuleInputRebuilt,
                            format!(
                                "'{}' mutated {}",
                                graph.description(*writer),
                                quoted_list(paths)
                            ),
                            Some(BacktraceSubject::Task(*writer)),
                        );
                        current = Some(*writer);
                    }
                }
            }
        }
    }
    backtrace
}

/// `'a'`, `'a' and 'b'`, `'a', 'b' and 'c'`.
fn quoted_list(paths: &[PathBuf]) -> String {
    let quoted: Vec<String> = paths
        .iter()
        .map(|p| format!("'{}'", p.display()))
        .collect();
    match quoted.split_last() {
        None => String::new(),
        Some((last, [])) => last.clone(),
        Some((last, rest)) => format!("{} and {last}", rest.join(", ")),
    }
}
