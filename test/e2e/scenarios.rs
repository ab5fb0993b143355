//! End-to-end controller scenarios against the in-memory cluster.
//!
//! Each test wires real informers, the work queue and the workers to a
//! [`MemoryCluster`], so every object travels list/watch -> cache ->
//! observer -> queue -> reconciler exactly as it would in production.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p taskrun-e2e --test scenarios
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use taskrun_api::core_v1::{Pod, PodPhase};
use taskrun_api::v1::Task;
use taskrun_api::{is_controlled_by, ObjectKey};
use taskrun_client::{Informer, MemoryCluster, Verb};
use taskrun_controller::cleanup::{CleanupWorker, CleanupWorkerConfig, CleanupWorkerDeps};
use taskrun_controller::clock::{FixedClock, SystemClock};
use taskrun_controller::handler::EventObserver;
use taskrun_controller::reconciler::{ReconcilerDeps, DEFAULT_CHILD_IMAGE};
use taskrun_controller::{
    Controller, ControllerConfig, ControllerDeps, ErrorReporter, Outcome, Reconciler,
};
use taskrun_reconcile::{default_controller_rate_limiter, WorkQueue};
use taskrun_testing::{init_tracing, succeeded_pod, task, wait_until};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Informers for both kinds, running until `shutdown` fires.
struct Caches {
    tasks: Arc<Informer<Task>>,
    pods: Arc<Informer<Pod>>,
    handles: Vec<JoinHandle<()>>,
}

impl Caches {
    fn new(cluster: &Arc<MemoryCluster>) -> Self {
        Self::with_resync(cluster, Duration::ZERO)
    }

    fn with_resync(cluster: &Arc<MemoryCluster>, resync: Duration) -> Self {
        Self {
            tasks: Arc::new(Informer::<Task>::new(cluster.clone(), resync)),
            pods: Arc::new(Informer::<Pod>::new(cluster.clone(), Duration::ZERO)),
            handles: Vec::new(),
        }
    }

    fn start(&mut self, shutdown: &watch::Receiver<bool>) {
        let tasks = Arc::clone(&self.tasks);
        let pods = Arc::clone(&self.pods);
        let (a, b) = (shutdown.clone(), shutdown.clone());
        self.handles.push(tokio::spawn(async move { tasks.run(a).await }));
        self.handles.push(tokio::spawn(async move { pods.run(b).await }));
    }

    async fn join(self) {
        for handle in self.handles {
            handle.await.unwrap();
        }
    }
}

async fn wait_for<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    wait_until(TIMEOUT, || std::future::ready(check())).await
}

/// A task is created; the controller runs its child and marks it succeeded.
#[tokio::test]
async fn scenario_a_new_task_gets_child_and_status() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::new());
    let mut caches = Caches::new(&cluster);
    let now = Utc::now();

    let controller = Arc::new(Controller::new(
        ControllerDeps {
            task_informer: Arc::clone(&caches.tasks),
            pod_informer: Arc::clone(&caches.pods),
            task_api: cluster.clone(),
            pod_api: cluster.clone(),
            clock: Arc::new(FixedClock(now)),
        },
        ControllerConfig::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    caches.start(&shutdown_rx);
    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run(shutdown_rx).await }
    });

    let foo = cluster.put_task(task("ns", "foo", "hello"));

    let child_name = format!("foo-{}", now.timestamp());
    let succeeded = wait_for(|| {
        cluster
            .task("ns", "foo")
            .is_some_and(|t| t.status.succeeded)
    })
    .await;
    assert!(succeeded, "task was never marked succeeded");

    let child = cluster.pod("ns", &child_name).expect("child pod");
    assert_eq!(child.spec.containers[0].args, vec!["hello"]);
    assert_eq!(child.spec.containers[0].image, DEFAULT_CHILD_IMAGE);
    assert!(is_controlled_by(&child, &foo));
    assert_eq!(cluster.pods().len(), 1);

    assert_eq!(controller.queue().num_requeues(&"ns/foo".to_string()), 0);
    assert_eq!(controller.reporter().total(), 0);

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
    caches.join().await;
}

/// Resyncs keep re-delivering a finished task; it never gets a second child.
#[tokio::test]
async fn resync_does_not_start_another_child() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::new());
    let mut caches = Caches::with_resync(&cluster, Duration::from_millis(50));

    let controller = Arc::new(Controller::new(
        ControllerDeps {
            task_informer: Arc::clone(&caches.tasks),
            pod_informer: Arc::clone(&caches.pods),
            task_api: cluster.clone(),
            pod_api: cluster.clone(),
            clock: Arc::new(SystemClock),
        },
        ControllerConfig::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    caches.start(&shutdown_rx);
    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run(shutdown_rx).await }
    });

    cluster.put_task(task("ns", "foo", "hello"));
    assert!(
        wait_for(|| cluster.task("ns", "foo").is_some_and(|t| t.status.succeeded)).await,
        "task was never marked succeeded"
    );

    // Long enough for many resyncs and a change of the clock's second
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(cluster.pods().len(), 1);

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
    caches.join().await;
}

/// A task deleted between enqueue and dequeue is dropped without API calls.
#[tokio::test]
async fn scenario_b_deleted_task_is_dropped() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::new());
    let mut caches = Caches::new(&cluster);

    let queue = WorkQueue::new("Tasks", default_controller_rate_limiter());
    let reporter = Arc::new(ErrorReporter::new());
    caches.tasks.add_event_handler(Arc::new(EventObserver::new(
        queue.clone(),
        Arc::clone(&reporter),
    )));
    let reconciler = Reconciler::new(
        queue.clone(),
        ReconcilerDeps {
            tasks: caches.tasks.store(),
            pods: caches.pods.store(),
            task_api: cluster.clone(),
            pod_api: cluster.clone(),
            reporter: Arc::clone(&reporter),
            clock: Arc::new(SystemClock),
        },
        DEFAULT_CHILD_IMAGE,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    caches.start(&shutdown_rx);

    cluster.put_task(task("ns", "foo", "hello"));
    assert!(wait_for(|| queue.len() == 1).await, "task was never enqueued");

    cluster.remove_task("ns", "foo");
    let store = caches.tasks.store();
    assert!(
        wait_for(|| store.get_by_key(&ObjectKey::new("ns", "foo")).is_none()).await,
        "delete never reached the cache"
    );
    cluster.clear_calls();

    assert_eq!(reconciler.process_next_work_item().await, Some(Outcome::Dropped));
    assert!(cluster.calls_for(Verb::Create).is_empty());
    assert!(cluster.calls_for(Verb::Update).is_empty());
    assert!(cluster.pods().is_empty());
    assert_eq!(queue.num_requeues(&"ns/foo".to_string()), 0);
    assert!(queue.is_empty());

    shutdown_tx.send(true).unwrap();
    caches.join().await;
}

/// A finished child is collected just after the retention window, never
/// before.
#[tokio::test]
async fn scenario_c_finished_child_collected_after_retention() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::new());
    let mut caches = Caches::new(&cluster);
    let retention = Duration::from_secs(300);

    let worker = CleanupWorker::new(
        CleanupWorkerDeps {
            tasks: caches.tasks.store(),
            pods: caches.pods.store(),
            pod_api: cluster.clone(),
            reporter: Arc::new(ErrorReporter::new()),
            clock: Arc::new(SystemClock),
        },
        CleanupWorkerConfig {
            interval: Duration::from_secs(60),
            child_retention: retention,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    caches.start(&shutdown_rx);

    let foo = cluster.put_task(task("ns", "foo", "hello"));
    let started = Utc::now() - TimeDelta::hours(1);
    cluster.put_pod(succeeded_pod(&foo, "foo-1000", started));

    let pods = caches.pods.store();
    let tasks = caches.tasks.store();
    assert!(wait_for(|| pods.len() == 1 && tasks.len() == 1).await);

    let window = TimeDelta::seconds(300);
    let early = worker.sweep(started + window - TimeDelta::seconds(1)).await;
    assert_eq!(early.pods_deleted, 0);
    assert!(cluster.pod("ns", "foo-1000").is_some());

    let late = worker.sweep(started + window + TimeDelta::seconds(1)).await;
    assert_eq!(late.tasks_scanned, 1);
    assert_eq!(late.pods_deleted, 1);
    assert!(cluster.pod("ns", "foo-1000").is_none());

    shutdown_tx.send(true).unwrap();
    caches.join().await;
}

/// The running controller collects the child it created once the pod
/// finishes and ages out.
#[tokio::test]
async fn controller_collects_its_own_finished_children() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::new());
    let mut caches = Caches::new(&cluster);
    let now = Utc::now();

    let controller = Arc::new(Controller::new(
        ControllerDeps {
            task_informer: Arc::clone(&caches.tasks),
            pod_informer: Arc::clone(&caches.pods),
            task_api: cluster.clone(),
            pod_api: cluster.clone(),
            clock: Arc::new(FixedClock(now)),
        },
        ControllerConfig {
            cleanup: CleanupWorkerConfig {
                interval: Duration::from_millis(50),
                child_retention: Duration::from_secs(60),
            },
            ..ControllerConfig::default()
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    caches.start(&shutdown_rx);
    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run(shutdown_rx).await }
    });

    cluster.put_task(task("ns", "foo", "hello"));
    let child_name = format!("foo-{}", now.timestamp());
    assert!(wait_for(|| cluster.pod("ns", &child_name).is_some()).await);

    // A running child is never collected
    cluster.set_pod_phase("ns", &child_name, PodPhase::Running, Some(now - TimeDelta::hours(1)));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cluster.pod("ns", &child_name).is_some());

    cluster.set_pod_phase("ns", &child_name, PodPhase::Succeeded, Some(now - TimeDelta::hours(1)));
    assert!(
        wait_for(|| cluster.pod("ns", &child_name).is_none()).await,
        "finished child was never collected"
    );
    assert!(cluster.task("ns", "foo").is_some());

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
    caches.join().await;
}
