//! Test fixtures shared across the taskrun workspace.

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use chrono::{DateTime, Utc};
use taskrun_api::core_v1::{Pod, PodPhase};
use taskrun_api::v1::Task;
use taskrun_api::{controller_ref, OwnerReference, Scheme};

/// A task with a fresh uid, as the API server would return it.
pub fn task(namespace: &str, name: &str, message: &str) -> Task {
    let mut task = Task::new(namespace, name, message);
    task.metadata.uid = uuid::Uuid::new_v4().to_string();
    task.metadata.resource_version = "1".to_string();
    task
}

/// Builder for pods in a given state.
#[derive(Debug, Clone)]
pub struct PodBuilder {
    pod: Pod,
}

impl PodBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        let mut pod = Pod::default();
        pod.metadata.namespace = namespace.to_string();
        pod.metadata.name = name.to_string();
        pod.metadata.uid = uuid::Uuid::new_v4().to_string();
        Self { pod }
    }

    /// Adds a controller reference to `owner`.
    pub fn owned_by(mut self, owner: &Task) -> Self {
        self.pod.metadata.owner_references.push(controller_ref(owner));
        self
    }

    /// Adds a non-controller reference to `owner`.
    pub fn referencing(mut self, owner: &Task) -> Self {
        self.pod.metadata.owner_references.push(OwnerReference {
            controller: None,
            ..controller_ref(owner)
        });
        self
    }

    pub fn phase(mut self, phase: PodPhase) -> Self {
        self.pod.status.phase = phase;
        self
    }

    pub fn started_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.pod.status.start_time = Some(start_time);
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }
}

/// A finished pod controlled by `owner` that started at `start_time`.
pub fn succeeded_pod(owner: &Task, name: &str, start_time: DateTime<Utc>) -> Pod {
    PodBuilder::new(&owner.metadata.namespace, name)
        .owned_by(owner)
        .phase(PodPhase::Succeeded)
        .started_at(start_time)
        .build()
}

/// Scheme with every taskrun type registered.
pub fn scheme() -> Arc<Scheme> {
    let mut scheme = Scheme::new();
    taskrun_api::v1::add_to_scheme(&mut scheme);
    taskrun_api::core_v1::add_to_scheme(&mut scheme);
    Arc::new(scheme)
}

/// Installs a test-writer tracing subscriber once per process.
///
/// Honors `RUST_LOG`; silent otherwise.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Polls `check` every 10ms until it returns true or `timeout` elapses.
///
/// Returns the last result of `check`.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
