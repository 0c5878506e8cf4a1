//! The rebuild decision.
//!
//! Rules are applied in priority order and the first one that fires wins.
//! Each `MustRun` carries a single [`Cause`]; the backtrace is assembled
//! later by following causes from task to task.

use std::path::{Path, PathBuf};

use kiln_common::NodeId;
use kiln_config::FingerprintMode;
use kiln_fs::Fingerprint;
use kiln_plan::Task;
use tracing::debug;

use crate::signature::ComputedSignature;
use crate::state::TaskRecord;

/// Why a task must run, one hop deep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause {
    /// No record of a previous successful run.
    NeverBuilt,
    /// The task runs in every build.
    AlwaysOutOfDate,
    /// An output is missing or was modified since the last run.
    OutputsStale,
    /// The compilation cache the task relied on was lost.
    CacheLost,
    /// The command half of the signature changed.
    SignatureChanged,
    /// An input changed.
    InputChanged {
        /// The input that changed.
        input: PathBuf,
        /// How it changed.
        change: InputChange,
    },
}

/// How an input changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputChange {
    /// A source file's fingerprint differs.
    SourceFile,
    /// A directory's contents differ.
    Directory,
    /// The task that produces the input ran in this build.
    ProducerRan(NodeId),
    /// A task that modifies the input in place ran in this build.
    Mutated {
        /// The mutating node.
        writer: NodeId,
        /// Every path the writer mutates.
        paths: Vec<PathBuf>,
    },
}

/// Outcome of deciding one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The task must execute.
    MustRun(Cause),
    /// The task's recorded results are current.
    UpToDate,
}

impl Decision {
    /// Returns `true` for [`Decision::MustRun`].
    pub fn must_run(&self) -> bool {
        matches!(self, Decision::MustRun(_))
    }

    /// The cause of a `MustRun` decision.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Decision::MustRun(cause) => Some(cause),
            Decision::UpToDate => None,
        }
    }
}

/// The task that last wrote an input, as seen in the current build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputWriter {
    /// The writing node.
    pub node: NodeId,
    /// Whether it executed in this build.
    pub ran: bool,
    /// The writer's mutated paths, if it modifies the input in place.
    pub mutated: Option<Vec<PathBuf>>,
}

/// The current state of one declared output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputCheck {
    /// Output path.
    pub path: PathBuf,
    /// Its fingerprint now.
    pub current: Fingerprint,
    /// Compare against the recorded fingerprint. Off for outputs that the task
    /// itself or a later task mutates in place.
    pub exact: bool,
}

/// Everything [`decide`] looks at.
pub struct DecisionInput<'a> {
    /// The task being decided.
    pub task: &'a Task,
    /// Its record from the last successful run.
    pub record: Option<&'a TaskRecord>,
    /// Its signature now.
    pub signature: &'a ComputedSignature,
    /// Its outputs now.
    pub outputs: &'a [OutputCheck],
    /// Whether the compilation cache was lost since the last build.
    pub cache_lost: bool,
    /// Process-wide fingerprint mode.
    pub mode: FingerprintMode,
    /// Returns the writer of an input within this build, if any.
    pub writer_of: &'a dyn Fn(&Path) -> Option<InputWriter>,
}

/// Decides whether a task must run.
pub fn decide(input: &DecisionInput<'_>) -> Decision {
    let decision = apply_rules(input);
    debug!(task = %input.task.description, ?decision, "decided");
    decision
}

fn apply_rules(input: &DecisionInput<'_>) -> Decision {
    let task = input.task;
    let Some(record) = input.record else {
        return Decision::MustRun(Cause::NeverBuilt);
    };
    if task.always_out_of_date {
        return Decision::MustRun(Cause::AlwaysOutOfDate);
    }
    let outputs_stale = input.outputs.iter().any(|output| {
        output.current.is_missing()
            || (output.exact && record.output(&output.path) != Some(output.current))
    });
    if outputs_stale {
        return Decision::MustRun(Cause::OutputsStale);
    }
    if input.cache_lost && (task.cache_kind().is_some() || task.scan_spec().is_some()) {
        return Decision::MustRun(Cause::CacheLost);
    }
    if record.signature.command != input.signature.signature.command {
        return Decision::MustRun(Cause::SignatureChanged);
    }

    for (path, current) in &input.signature.inputs {
        let recorded = record.input(path);
        let changed = recorded != Some(*current);
        let writer = (input.writer_of)(path.as_path()).filter(|w| w.ran);
        if let Some(writer) = writer {
            let counts = match input.mode {
                FingerprintMode::Timestamp => true,
                FingerprintMode::Content => changed,
            };
            if counts {
                let change = match writer.mutated {
                    Some(paths) => InputChange::Mutated {
                        writer: writer.node,
                        paths,
                    },
                    None => InputChange::ProducerRan(writer.node),
                };
                return Decision::MustRun(Cause::InputChanged {
                    input: path.clone(),
                    change,
                });
            }
        } else if changed {
            let is_dir = current.is_tree() || recorded.is_some_and(|r| r.is_tree());
            return Decision::MustRun(Cause::InputChanged {
                input: path.clone(),
                change: if is_dir {
                    InputChange::Directory
                } else {
                    InputChange::SourceFile
                },
            });
        }
    }

    // An input was dropped from the task without any remaining input changing.
    if record.signature.inputs != input.signature.signature.inputs {
        return Decision::MustRun(Cause::SignatureChanged);
    }
    Decision::UpToDate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Signature;
    use kiln_common::ContentHash;
    use kiln_plan::CacheKind;

    fn fp(content: &str) -> Fingerprint {
        Fingerprint::Content(ContentHash::from_bytes(content.as_bytes()))
    }

    fn task() -> Task {
        Task::new(["CompileC", "/b/a.o"], vec!["cc".to_string()])
            .with_inputs(["/s/a.c", "/b/gen.h"])
            .with_outputs(["/b/a.o"])
    }

    fn computed(task: &Task, inputs: &[(&str, Fingerprint)]) -> ComputedSignature {
        let inputs: Vec<(PathBuf, Fingerprint)> =
            inputs.iter().map(|(p, f)| (PathBuf::from(p), *f)).collect();
        ComputedSignature {
            signature: Signature::of(task, &inputs),
            inputs,
        }
    }

    fn baseline() -> (Task, ComputedSignature, TaskRecord, Vec<OutputCheck>) {
        let task = task();
        let sig = computed(&task, &[("/b/gen.h", fp("gen")), ("/s/a.c", fp("a"))]);
        let record = TaskRecord {
            signature: sig.signature,
            inputs: sig.inputs.clone(),
            outputs: vec![(PathBuf::from("/b/a.o"), fp("obj"))],
            cache_key: None,
            scan: None,
        };
        let outputs = vec![OutputCheck {
            path: PathBuf::from("/b/a.o"),
            current: fp("obj"),
            exact: true,
        }];
        (task, sig, record, outputs)
    }

    fn run(
        task: &Task,
        record: Option<&TaskRecord>,
        sig: &ComputedSignature,
        outputs: &[OutputCheck],
        mode: FingerprintMode,
        writer_of: &dyn Fn(&Path) -> Option<InputWriter>,
    ) -> Decision {
        decide(&DecisionInput {
            task,
            record,
            signature: sig,
            outputs,
            cache_lost: false,
            mode,
            writer_of,
        })
    }

    fn no_writers(_: &Path) -> Option<InputWriter> {
        None
    }

    #[test]
    fn unchanged_task_is_up_to_date() {
        let (task, sig, record, outputs) = baseline();
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Content, &no_writers);
        assert_eq!(d, Decision::UpToDate);
    }

    #[test]
    fn never_built_wins() {
        let (task, sig, _, outputs) = baseline();
        let d = run(&task, None, &sig, &outputs, FingerprintMode::Content, &no_writers);
        assert_eq!(d, Decision::MustRun(Cause::NeverBuilt));
    }

    #[test]
    fn always_out_of_date() {
        let (task, sig, record, outputs) = baseline();
        let task = task.always_out_of_date();
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Content, &no_writers);
        assert_eq!(d, Decision::MustRun(Cause::AlwaysOutOfDate));
    }

    #[test]
    fn missing_or_modified_outputs() {
        let (task, sig, record, mut outputs) = baseline();
        outputs[0].current = Fingerprint::Missing;
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Content, &no_writers);
        assert_eq!(d, Decision::MustRun(Cause::OutputsStale));

        outputs[0].current = fp("tampered");
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Content, &no_writers);
        assert_eq!(d, Decision::MustRun(Cause::OutputsStale));

        outputs[0].exact = false;
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Content, &no_writers);
        assert_eq!(d, Decision::UpToDate);
    }

    #[test]
    fn lost_cache_only_affects_cacheable_tasks() {
        let (task, sig, record, outputs) = baseline();
        let mut input = DecisionInput {
            task: &task,
            record: Some(&record),
            signature: &sig,
            outputs: &outputs,
            cache_lost: true,
            mode: FingerprintMode::Content,
            writer_of: &no_writers,
        };
        assert_eq!(decide(&input), Decision::UpToDate);
        let cacheable = task.clone().cacheable(CacheKind::Compile);
        input.task = &cacheable;
        assert_eq!(decide(&input), Decision::MustRun(Cause::CacheLost));
    }

    #[test]
    fn command_change() {
        let (task, _, record, outputs) = baseline();
        let task = task.with_env("CFLAGS", "-O2");
        let sig = computed(&task, &[("/b/gen.h", fp("gen")), ("/s/a.c", fp("a"))]);
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Content, &no_writers);
        assert_eq!(d, Decision::MustRun(Cause::SignatureChanged));
    }

    #[test]
    fn source_change() {
        let (task, _, record, outputs) = baseline();
        let sig = computed(&task, &[("/b/gen.h", fp("gen")), ("/s/a.c", fp("a2"))]);
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Content, &no_writers);
        assert_eq!(
            d,
            Decision::MustRun(Cause::InputChanged {
                input: PathBuf::from("/s/a.c"),
                change: InputChange::SourceFile
            })
        );
    }

    #[test]
    fn producer_ran_with_early_cutoff() {
        let (task, sig, record, outputs) = baseline();
        let producer = NodeId::from_raw(3);
        let ran = move |path: &Path| {
            (path == Path::new("/b/gen.h")).then(|| InputWriter {
                node: producer,
                ran: true,
                mutated: None,
            })
        };
        // Content unchanged: the rerun producer does not invalidate the consumer.
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Content, &ran);
        assert_eq!(d, Decision::UpToDate);
        // Timestamp mode has no early cutoff.
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Timestamp, &ran);
        assert_eq!(
            d,
            Decision::MustRun(Cause::InputChanged {
                input: PathBuf::from("/b/gen.h"),
                change: InputChange::ProducerRan(producer)
            })
        );
        // Content changed.
        let sig = computed(&task, &[("/b/gen.h", fp("gen2")), ("/s/a.c", fp("a"))]);
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Content, &ran);
        assert!(matches!(
            d,
            Decision::MustRun(Cause::InputChanged { change: InputChange::ProducerRan(_), .. })
        ));
    }

    #[test]
    fn mutation_is_reported_with_all_paths() {
        let (task, _, record, outputs) = baseline();
        let sig = computed(&task, &[("/b/gen.h", fp("signed")), ("/s/a.c", fp("a"))]);
        let mutator = NodeId::from_raw(9);
        let writer = move |path: &Path| {
            (path == Path::new("/b/gen.h")).then(|| InputWriter {
                node: mutator,
                ran: true,
                mutated: Some(vec![PathBuf::from("/b/gen.h"), PathBuf::from("/b/other")]),
            })
        };
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Content, &writer);
        assert_eq!(
            d,
            Decision::MustRun(Cause::InputChanged {
                input: PathBuf::from("/b/gen.h"),
                change: InputChange::Mutated {
                    writer: mutator,
                    paths: vec![PathBuf::from("/b/gen.h"), PathBuf::from("/b/other")],
                }
            })
        );
    }

    #[test]
    fn directory_inputs() {
        let (task, _, mut record, outputs) = baseline();
        let tree = |c: &str| Fingerprint::Tree(ContentHash::from_bytes(c.as_bytes()));
        record.inputs = vec![
            (PathBuf::from("/b/gen.h"), tree("v1")),
            (PathBuf::from("/s/a.c"), fp("a")),
        ];
        let sig = computed(&task, &[("/b/gen.h", tree("v2")), ("/s/a.c", fp("a"))]);
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Content, &no_writers);
        assert!(matches!(
            d,
            Decision::MustRun(Cause::InputChanged { change: InputChange::Directory, .. })
        ));
    }

    #[test]
    fn removed_input_still_forces_a_run() {
        let (task, _, record, outputs) = baseline();
        let sig = computed(&task, &[("/s/a.c", fp("a"))]);
        let d = run(&task, Some(&record), &sig, &outputs, FingerprintMode::Content, &no_writers);
        assert_eq!(d, Decision::MustRun(Cause::SignatureChanged));
    }
}
