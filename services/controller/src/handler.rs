//! Turns task cache notifications into work queue keys.

use std::fmt;
use std::sync::Arc;

use taskrun_api::v1::Task;
use taskrun_api::{ObjectKey, Resource};
use taskrun_client::{Delta, ResourceEventHandler};
use taskrun_reconcile::WorkQueue;
use tracing::debug;

use crate::error::{ErrorReporter, ReconcileError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Added => f.write_str("Added"),
            EventKind::Updated => f.write_str("Updated"),
            EventKind::Deleted => f.write_str("Deleted"),
        }
    }
}

/// Enqueues the key of every added or updated task.
///
/// Deletes are logged and otherwise ignored: child pods are collected by the
/// cluster through their owner reference.
pub struct EventObserver {
    queue: WorkQueue<String>,
    reporter: Arc<ErrorReporter>,
}

impl EventObserver {
    pub fn new(queue: WorkQueue<String>, reporter: Arc<ErrorReporter>) -> Self {
        Self { queue, reporter }
    }

    /// Resolves the payload to a live object and acts on `event`.
    pub fn handle_object(&self, delta: Delta<Arc<Task>>, event: EventKind) {
        let task = match delta {
            Delta::Live(task) => task,
            Delta::Tombstone(tombstone) => match tombstone.obj {
                Some(task) => {
                    debug!(name = %task.meta().name, "Recovered deleted object from tombstone");
                    task
                }
                None => {
                    self.reporter.report(&ReconcileError::Decode(format!(
                        "tombstone for {:?} carries no object",
                        tombstone.key
                    )));
                    return;
                }
            },
        };

        debug!(event = %event, name = %task.meta().name, "Observed task");

        if event == EventKind::Deleted {
            return;
        }

        self.enqueue(&task);
    }

    fn enqueue(&self, task: &Task) {
        match ObjectKey::from_meta(task.meta()) {
            Ok(key) => self.queue.add(key.to_string()),
            Err(e) => self
                .reporter
                .report(&ReconcileError::Decode(format!("cannot derive key: {e}"))),
        }
    }
}

impl ResourceEventHandler<Task> for EventObserver {
    fn on_add(&self, obj: &Arc<Task>) {
        self.handle_object(Delta::Live(Arc::clone(obj)), EventKind::Added);
    }

    fn on_update(&self, _old: &Arc<Task>, new: &Arc<Task>) {
        self.handle_object(Delta::Live(Arc::clone(new)), EventKind::Updated);
    }

    fn on_delete(&self, obj: Delta<Arc<Task>>) {
        self.handle_object(obj, EventKind::Deleted);
    }
}
