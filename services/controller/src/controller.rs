//! Controller wiring.
//!
//! Owns the work queue and the workers draining it:
//! - the reconcile loop, restarted after `reconcile_period` if it dies
//! - the cleanup worker, sweeping on its own interval
//!
//! Informers are run by the caller; the controller only registers its
//! observer on the task informer and waits for both caches to sync.

use std::sync::Arc;
use std::time::Duration;

use taskrun_api::core_v1::Pod;
use taskrun_api::v1::Task;
use taskrun_client::{wait_for_cache_sync, HasSynced, Informer, PodApi, TaskApi};
use taskrun_reconcile::{default_controller_rate_limiter, WorkQueue};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cleanup::{CleanupWorker, CleanupWorkerConfig, CleanupWorkerDeps};
use crate::clock::Clock;
use crate::error::{ControllerError, ErrorReporter};
use crate::handler::EventObserver;
use crate::reconciler::{Reconciler, ReconcilerDeps, DEFAULT_CHILD_IMAGE};

/// Name of the task work queue.
pub const QUEUE_NAME: &str = "Tasks";

/// How long `run` waits for each worker after shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Delay before restarting a reconcile loop that panicked.
    pub reconcile_period: Duration,
    pub cleanup: CleanupWorkerConfig,
    pub child_image: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_period: Duration::from_secs(10),
            cleanup: CleanupWorkerConfig::default(),
            child_image: DEFAULT_CHILD_IMAGE.to_string(),
        }
    }
}

/// Everything the controller is built from.
pub struct ControllerDeps {
    pub task_informer: Arc<Informer<Task>>,
    pub pod_informer: Arc<Informer<Pod>>,
    pub task_api: Arc<dyn TaskApi>,
    pub pod_api: Arc<dyn PodApi>,
    pub clock: Arc<dyn Clock>,
}

pub struct Controller {
    queue: WorkQueue<String>,
    reconciler: Arc<Reconciler>,
    cleanup: Arc<CleanupWorker>,
    caches: Vec<Arc<dyn HasSynced>>,
    reporter: Arc<ErrorReporter>,
    reconcile_period: Duration,
}

impl Controller {
    pub fn new(deps: ControllerDeps, config: ControllerConfig) -> Self {
        let queue = WorkQueue::new(QUEUE_NAME, default_controller_rate_limiter());
        let reporter = Arc::new(ErrorReporter::new());

        info!("Setting up event handlers");
        deps.task_informer.add_event_handler(Arc::new(EventObserver::new(
            queue.clone(),
            Arc::clone(&reporter),
        )));

        let reconciler = Reconciler::new(
            queue.clone(),
            ReconcilerDeps {
                tasks: deps.task_informer.store(),
                pods: deps.pod_informer.store(),
                task_api: deps.task_api,
                pod_api: Arc::clone(&deps.pod_api),
                reporter: Arc::clone(&reporter),
                clock: Arc::clone(&deps.clock),
            },
            config.child_image,
        );

        let cleanup = CleanupWorker::new(
            CleanupWorkerDeps {
                tasks: deps.task_informer.store(),
                pods: deps.pod_informer.store(),
                pod_api: deps.pod_api,
                reporter: Arc::clone(&reporter),
                clock: deps.clock,
            },
            config.cleanup,
        );

        Self {
            queue,
            reconciler: Arc::new(reconciler),
            cleanup: Arc::new(cleanup),
            caches: vec![
                deps.task_informer as Arc<dyn HasSynced>,
                deps.pod_informer as Arc<dyn HasSynced>,
            ],
            reporter,
            reconcile_period: config.reconcile_period,
        }
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    pub fn reporter(&self) -> &Arc<ErrorReporter> {
        &self.reporter
    }

    /// Runs until shutdown is signaled.
    ///
    /// Fails only if shutdown arrives before the caches have synced.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        info!("Starting controller");

        info!("Waiting for informer caches to sync");
        let caches: Vec<&dyn HasSynced> = self.caches.iter().map(|c| c.as_ref()).collect();
        if !wait_for_cache_sync(shutdown.clone(), &caches).await {
            self.queue.shut_down();
            return Err(ControllerError::CacheSync);
        }

        info!("Starting workers");
        let reconcile_handle = tokio::spawn(supervise(
            Arc::clone(&self.reconciler),
            self.reconcile_period,
            shutdown.clone(),
        ));
        let cleanup_handle = tokio::spawn({
            let cleanup = Arc::clone(&self.cleanup);
            let shutdown = shutdown.clone();
            async move { cleanup.run(shutdown).await }
        });
        info!("Started workers");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Shutting down workers");
        self.queue.shut_down();

        join_worker("reconcile loop", reconcile_handle).await;
        join_worker("cleanup worker", cleanup_handle).await;

        info!("Controller shutdown complete");
        Ok(())
    }
}

/// Runs the reconcile loop, restarting it after `period` when it panics.
///
/// Returns once the loop ends normally (queue shut down) or shutdown is
/// signaled.
async fn supervise(
    reconciler: Arc<Reconciler>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let handle = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.run().await }
        });

        match handle.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => error!("Reconcile loop panicked"),
            Err(e) => {
                warn!(error = %e, "Reconcile loop cancelled");
                break;
            }
        }

        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(period) => {
                info!(period_secs = period.as_secs(), "Restarting reconcile loop");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn join_worker(name: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(worker = name, error = %e, "Worker task failed"),
        Err(_) => warn!(worker = name, "Worker did not shut down in time"),
    }
}
