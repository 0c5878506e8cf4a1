//! Collection point for diagnostics raised by concurrently running tasks.

use crate::diagnostic::Diagnostic;
use crate::severity::Severity;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Collected {
    diagnostics: Vec<Diagnostic>,
    errors: usize,
    warnings: usize,
}

/// Diagnostics of one build, in emission order.
///
/// Workers hold an `Arc` to the same sink. Counts survive [`take_all`](Self::take_all)
/// so the end-of-build summary still sees them.
#[derive(Default)]
pub struct DiagnosticSink {
    inner: Mutex<Collected>,
}

impl DiagnosticSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a diagnostic.
    pub fn emit(&self, diag: Diagnostic) {
        let mut inner = self.lock();
        match diag.severity {
            Severity::Error => inner.errors += 1,
            Severity::Warning => inner.warnings += 1,
            Severity::Note => {}
        }
        inner.diagnostics.push(diag);
    }

    /// Number of diagnostics of `severity` emitted so far. Notes are not counted.
    pub fn count(&self, severity: Severity) -> usize {
        let inner = self.lock();
        match severity {
            Severity::Error => inner.errors,
            Severity::Warning => inner.warnings,
            Severity::Note => 0,
        }
    }

    /// Whether any error was emitted.
    pub fn has_errors(&self) -> bool {
        self.count(Severity::Error) > 0
    }

    /// Drains the collected diagnostics.
    pub fn take_all(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.lock().diagnostics)
    }

    /// Diagnostics about one task or path, in emission order.
    pub fn for_subject(&self, subject: &str) -> Vec<Diagnostic> {
        self.lock()
            .diagnostics
            .iter()
            .filter(|d| d.subject.as_deref() == Some(subject))
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Collected> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::DiagnosticCode;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counts_errors_and_warnings_only() {
        let sink = DiagnosticSink::new();
        assert!(!sink.has_errors());
        sink.emit(Diagnostic::error(DiagnosticCode::TASK_FAILED, "'Link app' failed"));
        sink.emit(Diagnostic::warning(DiagnosticCode::CACHE_UNAVAILABLE, "cache gone"));
        sink.emit(Diagnostic::note(DiagnosticCode::CACHE_REMARK, "cache hit: k"));
        assert!(sink.has_errors());
        assert_eq!(sink.count(Severity::Error), 1);
        assert_eq!(sink.count(Severity::Warning), 1);
        assert_eq!(sink.count(Severity::Note), 0);
    }

    #[test]
    fn draining_keeps_counts() {
        let sink = DiagnosticSink::new();
        sink.emit(Diagnostic::error(DiagnosticCode::SCAN_FAILED, "scan failed"));
        assert_eq!(sink.take_all().len(), 1);
        assert!(sink.take_all().is_empty());
        assert!(sink.has_errors());
    }

    #[test]
    fn filters_by_subject() {
        let sink = DiagnosticSink::new();
        sink.emit(
            Diagnostic::note(DiagnosticCode::CACHE_REMARK, "cache miss: 1").with_subject("Compile a.c"),
        );
        sink.emit(
            Diagnostic::note(DiagnosticCode::CACHE_REMARK, "cache miss: 2").with_subject("Compile b.c"),
        );
        let about_a = sink.for_subject("Compile a.c");
        assert_eq!(about_a.len(), 1);
        assert_eq!(about_a[0].message, "cache miss: 1");
    }

    #[test]
    fn workers_emit_concurrently() {
        let sink = Arc::new(DiagnosticSink::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    for task in 0..50 {
                        sink.emit(Diagnostic::warning(
                            DiagnosticCode::STATE_STORE,
                            format!("worker {worker} task {task}"),
                        ));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sink.count(Severity::Warning), 400);
        assert_eq!(sink.take_all().len(), 400);
    }
}
