//! Controller error types and the shared error sink.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use taskrun_api::KeyError;
use taskrun_client::{ApiError, CacheError};
use tracing::{error, warn};

/// Result type for a single reconcile or sweep step.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Non-fatal errors raised while reconciling or sweeping.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("error decoding object: {0}")]
    Decode(String),

    #[error("invalid resource key {key:?}: {source}")]
    MalformedKey {
        key: String,
        #[source]
        source: KeyError,
    },

    #[error("task {key:?} in work queue no longer exists")]
    NotFound { key: String },

    #[error("error reading task {key:?} from cache: {source}")]
    Cache {
        key: String,
        #[source]
        source: CacheError,
    },

    #[error("error creating child pod for {key:?}: {source}")]
    CreateChild {
        key: String,
        #[source]
        source: ApiError,
    },

    #[error("error updating status of {key:?}: {source}")]
    UpdateStatus {
        key: String,
        #[source]
        source: ApiError,
    },

    #[error("error listing tasks: {0}")]
    ListTasks(#[source] CacheError),

    #[error("error listing pods in namespace {namespace:?}: {source}")]
    ListPods {
        namespace: String,
        #[source]
        source: CacheError,
    },

    #[error("error deleting pod {namespace}/{name}: {source}")]
    DeleteChild {
        namespace: String,
        name: String,
        #[source]
        source: ApiError,
    },
}

impl ReconcileError {
    /// Whether the key should be retried with backoff.
    ///
    /// Errors that no retry can fix are dropped instead.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ReconcileError::Decode(_)
                | ReconcileError::MalformedKey { .. }
                | ReconcileError::NotFound { .. }
        )
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Decode(_) => ErrorClass::Decode,
            ReconcileError::MalformedKey { .. } => ErrorClass::MalformedKey,
            ReconcileError::NotFound { .. } => ErrorClass::NotFound,
            ReconcileError::Cache { .. } => ErrorClass::Cache,
            ReconcileError::CreateChild { .. } => ErrorClass::CreateChild,
            ReconcileError::UpdateStatus { .. } => ErrorClass::UpdateStatus,
            ReconcileError::ListTasks(_) => ErrorClass::ListTasks,
            ReconcileError::ListPods { .. } => ErrorClass::ListPods,
            ReconcileError::DeleteChild { .. } => ErrorClass::DeleteChild,
        }
    }
}

/// Coarse grouping of [`ReconcileError`] used for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorClass {
    Decode,
    MalformedKey,
    NotFound,
    Cache,
    CreateChild,
    UpdateStatus,
    ListTasks,
    ListPods,
    DeleteChild,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Decode => "decode",
            ErrorClass::MalformedKey => "malformed_key",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Cache => "cache",
            ErrorClass::CreateChild => "create_child",
            ErrorClass::UpdateStatus => "update_status",
            ErrorClass::ListTasks => "list_tasks",
            ErrorClass::ListPods => "list_pods",
            ErrorClass::DeleteChild => "delete_child",
        };
        f.write_str(name)
    }
}

/// Fatal controller errors.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to wait for caches to sync")]
    CacheSync,
}

/// Sink for every non-fatal error. Logs and counts; never panics.
#[derive(Debug, Default)]
pub struct ErrorReporter {
    counts: Mutex<BTreeMap<ErrorClass, u64>>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, err: &ReconcileError) {
        let class = err.class();
        if err.is_retryable() {
            error!(error = %err, class = %class, "Reconcile error");
        } else {
            warn!(error = %err, class = %class, "Dropping unprocessable item");
        }

        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(class)
            .or_default() += 1;
    }

    /// Errors reported for `class` so far.
    pub fn count(&self, class: ErrorClass) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&class)
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn key() -> String {
        "ns/foo".to_string()
    }

    fn malformed() -> ReconcileError {
        ReconcileError::MalformedKey {
            key: "a/b/c".into(),
            source: KeyError::Malformed("a/b/c".into()),
        }
    }

    fn cache() -> ReconcileError {
        ReconcileError::Cache {
            key: key(),
            source: CacheError::Unavailable("down".into()),
        }
    }

    fn create() -> ReconcileError {
        ReconcileError::CreateChild {
            key: key(),
            source: ApiError::Http("reset".into()),
        }
    }

    fn update() -> ReconcileError {
        ReconcileError::UpdateStatus {
            key: key(),
            source: ApiError::Conflict("stale".into()),
        }
    }

    #[rstest]
    #[case(ReconcileError::Decode("bad".into()), false)]
    #[case(ReconcileError::NotFound { key: key() }, false)]
    #[case(malformed(), false)]
    #[case(cache(), true)]
    #[case(create(), true)]
    #[case(update(), true)]
    fn test_retryable(#[case] err: ReconcileError, #[case] retryable: bool) {
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn test_reporter_counts_per_class() {
        let reporter = ErrorReporter::new();
        reporter.report(&ReconcileError::Decode("bad".into()));
        reporter.report(&ReconcileError::Decode("worse".into()));
        reporter.report(&ReconcileError::ListTasks(CacheError::Unavailable("down".into())));

        assert_eq!(reporter.count(ErrorClass::Decode), 2);
        assert_eq!(reporter.count(ErrorClass::ListTasks), 1);
        assert_eq!(reporter.count(ErrorClass::DeleteChild), 0);
        assert_eq!(reporter.total(), 3);
    }
}
