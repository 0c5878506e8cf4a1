//! The ordered log of what a build did.

use std::sync::{Mutex, PoisonError};

/// One step of a build, identified by task description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    /// The dependency scan of a task started.
    ScanStarted(String),
    /// The dependency scan of a task finished successfully.
    ScanCompleted(String),
    /// The previous scan result of a task was reused.
    ScanReused(String),
    /// The dependency scan of a task failed.
    ScanFailed(String),
    /// A scan inserted a module build task.
    DynamicTaskRegistered {
        /// Description of the inserted task.
        task: String,
        /// Description of the consumer whose scan requested it.
        requested_by: String,
    },
    /// A task was found up to date and skipped.
    UpToDate(String),
    /// A cache lookup for a task hit.
    CacheHit(String),
    /// A cache lookup for a task missed.
    CacheMiss(String),
    /// The executor was invoked for a task.
    TaskStarted(String),
    /// A task finished successfully.
    TaskCompleted(String),
    /// A task failed.
    TaskFailed(String),
    /// A task was not attempted because a dependency failed.
    TaskBlocked(String),
    /// A task was not attempted because the build was cancelled.
    TaskCancelled(String),
}

impl BuildEvent {
    /// The description of the task the event is about.
    pub fn task(&self) -> &str {
        match self {
            BuildEvent::ScanStarted(task)
            | BuildEvent::ScanCompleted(task)
            | BuildEvent::ScanReused(task)
            | BuildEvent::ScanFailed(task)
            | BuildEvent::UpToDate(task)
            | BuildEvent::CacheHit(task)
            | BuildEvent::CacheMiss(task)
            | BuildEvent::TaskStarted(task)
            | BuildEvent::TaskCompleted(task)
            | BuildEvent::TaskFailed(task)
            | BuildEvent::TaskBlocked(task)
            | BuildEvent::TaskCancelled(task) => task,
            BuildEvent::DynamicTaskRegistered { task, .. } => task,
        }
    }
}

/// Thread-safe, append-only event log.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<BuildEvent>>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    pub fn push(&self, event: BuildEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Takes every event recorded so far, in order.
    pub fn take(&self) -> Vec<BuildEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_keep_order() {
        let log = EventLog::new();
        log.push(BuildEvent::ScanStarted("Compile a.c".into()));
        log.push(BuildEvent::ScanCompleted("Compile a.c".into()));
        log.push(BuildEvent::TaskStarted("Compile a.c".into()));
        let events = log.take();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], BuildEvent::ScanStarted(_)));
        assert!(events.iter().all(|e| e.task() == "Compile a.c"));
        assert!(log.take().is_empty());
    }
}
