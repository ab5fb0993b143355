//! Task reconciler.
//!
//! Drains the work queue one key at a time. For each key:
//! - Load the task from the local cache
//! - Create a child pod echoing the task's message, unless the task already
//!   controls one
//! - Mark the task succeeded
//!
//! A task already marked succeeded is left alone, so resyncs and the echo
//! of our own status write never start another child.
//!
//! Missing tasks and unparsable keys are dropped. Cache and API failures
//! requeue the key with backoff.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use taskrun_api::core_v1::{Container, Pod, PodSpec, RestartPolicy, SecurityContext};
use taskrun_api::v1::Task;
use taskrun_api::{controller_ref, is_controlled_by, ObjectKey, ObjectMeta, Selector};
use taskrun_client::{PodApi, PodLister, TaskApi, TaskLister};
use taskrun_reconcile::WorkQueue;
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::error::{ErrorReporter, ReconcileError, ReconcileResult};

/// Image run by child pods unless configured otherwise.
pub const DEFAULT_CHILD_IMAGE: &str = "gcr.io/distroless/static-debian11:debug-amd64";

/// Name of the single container in a child pod.
pub const CHILD_CONTAINER_NAME: &str = "main";

/// How a dequeued key was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Task has its child and is marked succeeded; backoff history cleared.
    Synced,
    /// Key cannot be processed; backoff history cleared.
    Dropped,
    /// Transient failure; key re-added with backoff.
    Requeued,
}

/// Capabilities the reconciler needs.
#[derive(Clone)]
pub struct ReconcilerDeps {
    pub tasks: Arc<dyn TaskLister>,
    pub pods: Arc<dyn PodLister>,
    pub task_api: Arc<dyn TaskApi>,
    pub pod_api: Arc<dyn PodApi>,
    pub reporter: Arc<ErrorReporter>,
    pub clock: Arc<dyn Clock>,
}

pub struct Reconciler {
    queue: WorkQueue<String>,
    deps: ReconcilerDeps,
    child_image: String,
}

impl Reconciler {
    pub fn new(
        queue: WorkQueue<String>,
        deps: ReconcilerDeps,
        child_image: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            deps,
            child_image: child_image.into(),
        }
    }

    /// Processes keys until the queue is shut down and drained.
    #[instrument(skip(self), fields(queue = %self.queue.name()))]
    pub async fn run(&self) {
        info!("Starting reconcile loop");
        while self.process_next_work_item().await.is_some() {}
        info!("Reconcile loop finished");
    }

    /// Handles one key. Returns `None` once the queue is shut down.
    pub async fn process_next_work_item(&self) -> Option<Outcome> {
        let item = self.queue.get().await?;
        let key = item.key().clone();

        let outcome = match self.sync(&key).await {
            Ok(()) => {
                self.queue.forget(&key);
                Outcome::Synced
            }
            Err(e) if e.is_retryable() => {
                self.deps.reporter.report(&e);
                self.queue.add_rate_limited(key.clone());
                Outcome::Requeued
            }
            Err(e) => {
                self.deps.reporter.report(&e);
                self.queue.forget(&key);
                Outcome::Dropped
            }
        };

        debug!(key = %key, outcome = ?outcome, "Processed work item");
        drop(item);
        Some(outcome)
    }

    async fn sync(&self, key: &str) -> ReconcileResult<()> {
        let parsed = ObjectKey::parse(key).map_err(|source| ReconcileError::MalformedKey {
            key: key.to_string(),
            source,
        })?;

        let task = self
            .deps
            .tasks
            .get(&parsed.namespace, &parsed.name)
            .map_err(|source| ReconcileError::Cache {
                key: key.to_string(),
                source,
            })?
            .ok_or_else(|| ReconcileError::NotFound {
                key: key.to_string(),
            })?;

        info!(key = %key, "Dequeued task from work queue");

        if task.status.succeeded {
            debug!(key = %key, "Task already succeeded");
            return Ok(());
        }

        self.ensure_child(key, &task).await?;
        self.mark_succeeded(key, &task).await
    }

    async fn ensure_child(&self, key: &str, task: &Task) -> ReconcileResult<()> {
        let namespace = &task.metadata.namespace;

        let existing = self
            .deps
            .pods
            .list(namespace, &Selector::everything())
            .map_err(|source| ReconcileError::Cache {
                key: key.to_string(),
                source,
            })?
            .into_iter()
            .find(|pod| is_controlled_by::<Task, Pod>(pod, task));
        if let Some(pod) = existing {
            debug!(
                namespace = %namespace,
                name = %pod.metadata.name,
                "Task already controls a child pod"
            );
            return Ok(());
        }

        let pod = new_child_pod(task, &self.child_image, self.deps.clock.now());

        match self.deps.pod_api.create_pod(namespace, &pod).await {
            Ok(created) => {
                info!(
                    namespace = %created.metadata.namespace,
                    name = %created.metadata.name,
                    "Created child pod"
                );
                Ok(())
            }
            // Same task, same second: the pod from the earlier attempt stands
            Err(e) if e.is_already_exists() => {
                info!(
                    namespace = %namespace,
                    name = %pod.metadata.name,
                    "Child pod already exists"
                );
                Ok(())
            }
            Err(source) => Err(ReconcileError::CreateChild {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn mark_succeeded(&self, key: &str, task: &Task) -> ReconcileResult<()> {
        let mut updated = task.clone();
        updated.status.succeeded = true;

        self.deps
            .task_api
            .update_task(&task.metadata.namespace, &updated)
            .await
            .map_err(|source| ReconcileError::UpdateStatus {
                key: key.to_string(),
                source,
            })?;

        debug!(key = %key, "Marked task succeeded");
        Ok(())
    }
}

/// Builds the child pod for `task` as of `now`.
///
/// The name is `<task>-<unix seconds>`; the pod runs `echo <message>` once
/// and is controlled by the task.
pub fn new_child_pod(task: &Task, image: &str, now: DateTime<Utc>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: format!("{}-{}", task.metadata.name, now.timestamp()),
            namespace: task.metadata.namespace.clone(),
            owner_references: vec![controller_ref(task)],
            ..Default::default()
        },
        spec: PodSpec {
            restart_policy: RestartPolicy::Never,
            containers: vec![Container {
                name: CHILD_CONTAINER_NAME.to_string(),
                image: image.to_string(),
                command: vec!["echo".to_string()],
                args: vec![task.spec.message.clone()],
                security_context: Some(SecurityContext {
                    read_only_root_filesystem: Some(true),
                }),
            }],
        },
        status: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::error::ErrorClass;
    use chrono::{TimeDelta, TimeZone};
    use std::sync::Mutex;
    use taskrun_api::core_v1::PodPhase;
    use taskrun_client::{ApiError, CacheError, MemoryCluster, Store, Verb};
    use taskrun_reconcile::default_controller_rate_limiter;
    use taskrun_testing::{task, PodBuilder};

    /// Lister that fails every read.
    struct BrokenLister;

    impl TaskLister for BrokenLister {
        fn get(&self, _: &str, _: &str) -> Result<Option<Arc<Task>>, CacheError> {
            Err(CacheError::Unavailable("informer stopped".to_string()))
        }

        fn list(&self, _: &Selector) -> Result<Vec<Arc<Task>>, CacheError> {
            Err(CacheError::Unavailable("informer stopped".to_string()))
        }
    }

    impl PodLister for BrokenLister {
        fn list(&self, _: &str, _: &Selector) -> Result<Vec<Arc<Pod>>, CacheError> {
            Err(CacheError::Unavailable("informer stopped".to_string()))
        }
    }

    /// Clock that moves forward by `step` on every read.
    struct SteppingClock {
        now: Mutex<DateTime<Utc>>,
        step: TimeDelta,
    }

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Utc> {
            let mut now = self.now.lock().unwrap();
            *now += self.step;
            *now
        }
    }

    struct Fixture {
        cluster: Arc<MemoryCluster>,
        store: Arc<Store<Task>>,
        pods: Arc<Store<Pod>>,
        queue: WorkQueue<String>,
        reporter: Arc<ErrorReporter>,
        reconciler: Reconciler,
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_000, 0).unwrap()
    }

    fn fixture_with(
        tasks: Arc<dyn TaskLister>,
        store: Arc<Store<Task>>,
        pod_lister: Option<Arc<dyn PodLister>>,
        clock: Arc<dyn Clock>,
    ) -> Fixture {
        let cluster = Arc::new(MemoryCluster::new());
        let pods: Arc<Store<Pod>> = Arc::new(Store::new());
        let pod_lister = pod_lister.unwrap_or_else(|| pods.clone());
        let queue = WorkQueue::new("tasks", default_controller_rate_limiter());
        let reporter = Arc::new(ErrorReporter::new());
        let reconciler = Reconciler::new(
            queue.clone(),
            ReconcilerDeps {
                tasks,
                pods: pod_lister,
                task_api: cluster.clone(),
                pod_api: cluster.clone(),
                reporter: Arc::clone(&reporter),
                clock,
            },
            DEFAULT_CHILD_IMAGE,
        );
        Fixture {
            cluster,
            store,
            pods,
            queue,
            reporter,
            reconciler,
        }
    }

    fn fixture() -> Fixture {
        let store: Arc<Store<Task>> = Arc::new(Store::new());
        fixture_with(store.clone(), store, None, Arc::new(FixedClock(now())))
    }

    /// Stores `task` in both the cluster and the cache, as a synced
    /// informer would.
    fn seed(f: &Fixture, task: Task) -> Task {
        let stored = f.cluster.put_task(task);
        f.store.upsert(Arc::new(stored.clone()));
        stored
    }

    #[test]
    fn test_child_pod_shape() {
        let parent = task("ns", "foo", "hello");
        let pod = new_child_pod(&parent, DEFAULT_CHILD_IMAGE, now());

        assert_eq!(pod.metadata.name, "foo-1000");
        assert_eq!(pod.metadata.namespace, "ns");
        assert!(is_controlled_by(&pod, &parent));
        assert_eq!(pod.metadata.owner_references[0].block_owner_deletion, Some(true));
        assert_eq!(pod.spec.restart_policy, RestartPolicy::Never);

        let container = &pod.spec.containers[0];
        assert_eq!(container.name, "main");
        assert_eq!(container.command, vec!["echo"]);
        assert_eq!(container.args, vec!["hello"]);
        assert_eq!(
            container.security_context.as_ref().unwrap().read_only_root_filesystem,
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_success_creates_child_and_marks_task() {
        let f = fixture();
        seed(&f, task("ns", "foo", "hello"));
        f.queue.add("ns/foo".to_string());

        assert_eq!(f.reconciler.process_next_work_item().await, Some(Outcome::Synced));

        assert_eq!(f.cluster.calls_for(Verb::Create).len(), 1);
        assert_eq!(f.cluster.calls_for(Verb::Update).len(), 1);
        assert!(f.cluster.task("ns", "foo").unwrap().status.succeeded);

        let pod = f.cluster.pod("ns", "foo-1000").unwrap();
        assert_eq!(pod.spec.containers[0].args, vec!["hello"]);

        assert_eq!(f.queue.num_requeues(&"ns/foo".to_string()), 0);
        assert!(f.queue.is_empty());
        assert_eq!(f.reporter.total(), 0);
    }

    #[tokio::test]
    async fn test_missing_task_is_dropped_without_api_calls() {
        let f = fixture();
        f.queue.add("ns/foo".to_string());

        assert_eq!(f.reconciler.process_next_work_item().await, Some(Outcome::Dropped));

        assert!(f.cluster.calls().is_empty());
        assert_eq!(f.queue.num_requeues(&"ns/foo".to_string()), 0);
        assert_eq!(f.reporter.count(ErrorClass::NotFound), 1);
    }

    #[tokio::test]
    async fn test_malformed_key_is_dropped() {
        let f = fixture();
        f.queue.add("a/b/c".to_string());

        assert_eq!(f.reconciler.process_next_work_item().await, Some(Outcome::Dropped));
        assert!(f.cluster.calls().is_empty());
        assert_eq!(f.reporter.count(ErrorClass::MalformedKey), 1);
    }

    #[tokio::test]
    async fn test_cache_failure_is_requeued() {
        let f = fixture_with(
            Arc::new(BrokenLister),
            Arc::new(Store::new()),
            None,
            Arc::new(FixedClock(now())),
        );
        f.queue.add("ns/foo".to_string());

        assert_eq!(f.reconciler.process_next_work_item().await, Some(Outcome::Requeued));
        assert_eq!(f.queue.num_requeues(&"ns/foo".to_string()), 1);
        assert_eq!(f.reporter.count(ErrorClass::Cache), 1);
    }

    #[tokio::test]
    async fn test_create_failure_is_requeued_without_update() {
        let f = fixture();
        seed(&f, task("ns", "foo", "hello"));
        f.cluster
            .fail_next(Verb::Create, ApiError::Http("connection reset".to_string()));
        f.queue.add("ns/foo".to_string());

        assert_eq!(f.reconciler.process_next_work_item().await, Some(Outcome::Requeued));

        assert!(f.cluster.calls_for(Verb::Update).is_empty());
        assert!(!f.cluster.task("ns", "foo").unwrap().status.succeeded);
        assert_eq!(f.queue.num_requeues(&"ns/foo".to_string()), 1);
        assert_eq!(f.reporter.count(ErrorClass::CreateChild), 1);
    }

    #[tokio::test]
    async fn test_update_conflict_is_requeued() {
        let f = fixture();
        seed(&f, task("ns", "foo", "hello"));
        f.cluster
            .fail_next(Verb::Update, ApiError::Conflict("stale".to_string()));
        f.queue.add("ns/foo".to_string());

        assert_eq!(f.reconciler.process_next_work_item().await, Some(Outcome::Requeued));

        assert_eq!(f.cluster.calls_for(Verb::Create).len(), 1);
        assert_eq!(f.queue.num_requeues(&"ns/foo".to_string()), 1);
        assert_eq!(f.reporter.count(ErrorClass::UpdateStatus), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_within_same_second_reuses_child() {
        let f = fixture();
        seed(&f, task("ns", "foo", "hello"));
        f.cluster
            .fail_next(Verb::Update, ApiError::Http("timeout".to_string()));
        f.queue.add("ns/foo".to_string());

        assert_eq!(f.reconciler.process_next_work_item().await, Some(Outcome::Requeued));
        // Backoff elapses under paused time; the clock still reads the same second
        assert_eq!(f.reconciler.process_next_work_item().await, Some(Outcome::Synced));

        assert_eq!(f.cluster.pods().len(), 1);
        assert_eq!(f.cluster.calls_for(Verb::Create).len(), 2);
        assert!(f.cluster.task("ns", "foo").unwrap().status.succeeded);
        assert_eq!(f.queue.num_requeues(&"ns/foo".to_string()), 0);
    }

    #[tokio::test]
    async fn test_pod_cache_failure_is_requeued_without_create() {
        let store: Arc<Store<Task>> = Arc::new(Store::new());
        let f = fixture_with(
            store.clone(),
            store,
            Some(Arc::new(BrokenLister)),
            Arc::new(FixedClock(now())),
        );
        seed(&f, task("ns", "foo", "hello"));
        f.queue.add("ns/foo".to_string());

        assert_eq!(f.reconciler.process_next_work_item().await, Some(Outcome::Requeued));
        assert!(f.cluster.calls_for(Verb::Create).is_empty());
        assert_eq!(f.reporter.count(ErrorClass::Cache), 1);
    }

    #[tokio::test]
    async fn test_rerun_does_not_recreate_child() {
        let store: Arc<Store<Task>> = Arc::new(Store::new());
        let clock = Arc::new(SteppingClock {
            now: Mutex::new(now()),
            step: TimeDelta::seconds(30),
        });
        let f = fixture_with(store.clone(), store, None, clock);
        seed(&f, task("ns", "foo", "hello"));

        for _ in 0..3 {
            f.queue.add("ns/foo".to_string());
            assert_eq!(f.reconciler.process_next_work_item().await, Some(Outcome::Synced));
            // Feed the caches the way the informers would
            f.store
                .upsert(Arc::new(f.cluster.task("ns", "foo").unwrap()));
            for pod in f.cluster.pods() {
                f.pods.upsert(Arc::new(pod));
            }
        }

        assert_eq!(f.cluster.pods().len(), 1);
        assert_eq!(f.cluster.calls_for(Verb::Create).len(), 1);
        assert_eq!(f.cluster.calls_for(Verb::Update).len(), 1);
        assert_eq!(f.reporter.total(), 0);
    }

    #[tokio::test]
    async fn test_existing_child_is_reused_before_status_update() {
        let f = fixture();
        let parent = seed(&f, task("ns", "foo", "hello"));
        let child = f.cluster.put_pod(
            PodBuilder::new("ns", "foo-900")
                .owned_by(&parent)
                .phase(PodPhase::Running)
                .build(),
        );
        f.pods.upsert(Arc::new(child));
        f.queue.add("ns/foo".to_string());

        assert_eq!(f.reconciler.process_next_work_item().await, Some(Outcome::Synced));

        assert!(f.cluster.calls_for(Verb::Create).is_empty());
        assert_eq!(f.cluster.pods().len(), 1);
        assert!(f.cluster.task("ns", "foo").unwrap().status.succeeded);
    }

    #[tokio::test]
    async fn test_pod_referencing_task_without_control_is_ignored() {
        let f = fixture();
        let parent = seed(&f, task("ns", "foo", "hello"));
        let other = f.cluster.put_pod(PodBuilder::new("ns", "bar").referencing(&parent).build());
        f.pods.upsert(Arc::new(other));
        f.queue.add("ns/foo".to_string());

        assert_eq!(f.reconciler.process_next_work_item().await, Some(Outcome::Synced));
        assert_eq!(f.cluster.calls_for(Verb::Create).len(), 1);
        assert!(f.cluster.pod("ns", "foo-1000").is_some());
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let f = fixture();
        seed(&f, task("ns", "foo", "hello"));
        f.queue.add("ns/foo".to_string());
        f.queue.shut_down();

        f.reconciler.run().await;

        assert!(f.cluster.task("ns", "foo").unwrap().status.succeeded);
        assert_eq!(f.reconciler.process_next_work_item().await, None);
    }
}
