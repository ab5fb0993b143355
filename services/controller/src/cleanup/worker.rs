use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use taskrun_api::core_v1::Pod;
use taskrun_api::v1::Task;
use taskrun_api::{is_controlled_by, Selector};
use taskrun_client::{PodApi, PodLister, PropagationPolicy, TaskLister};
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::error::{ErrorReporter, ReconcileError};

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub interval: Duration,
    pub child_retention: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            child_retention: Duration::from_secs(300),
        }
    }
}

/// Capabilities the cleanup worker needs.
#[derive(Clone)]
pub struct CleanupWorkerDeps {
    pub tasks: Arc<dyn TaskLister>,
    pub pods: Arc<dyn PodLister>,
    pub pod_api: Arc<dyn PodApi>,
    pub reporter: Arc<ErrorReporter>,
    pub clock: Arc<dyn Clock>,
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub tasks_scanned: usize,
    pub pods_deleted: usize,
    pub delete_failures: usize,
}

pub struct CleanupWorker {
    deps: CleanupWorkerDeps,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(deps: CleanupWorkerDeps, config: CleanupWorkerConfig) -> Self {
        Self { deps, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            child_retention_secs = self.config.child_retention.as_secs(),
            "Starting cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(self.deps.clock.now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Deletes every expired, succeeded child pod as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepStats {
        let mut stats = SweepStats::default();

        let tasks = match self.deps.tasks.list(&Selector::everything()) {
            Ok(tasks) => tasks,
            Err(e) if e.is_not_found() => return stats,
            Err(e) => {
                self.deps.reporter.report(&ReconcileError::ListTasks(e));
                return stats;
            }
        };

        let cutoff = self.cutoff(now);

        for task in tasks {
            stats.tasks_scanned += 1;
            let namespace = &task.metadata.namespace;

            let pods = match self.deps.pods.list(namespace, &Selector::everything()) {
                Ok(pods) => pods,
                Err(e) if e.is_not_found() => continue,
                Err(source) => {
                    self.deps.reporter.report(&ReconcileError::ListPods {
                        namespace: namespace.clone(),
                        source,
                    });
                    continue;
                }
            };

            let expired = pods
                .iter()
                .filter(|pod| is_controlled_by::<Task, Pod>(pod, &task))
                .filter(|pod| pod.status.phase.is_succeeded())
                .filter(|pod| started_before(pod, cutoff));

            for pod in expired {
                let name = &pod.metadata.name;
                match self
                    .deps
                    .pod_api
                    .delete_pod(namespace, name, PropagationPolicy::Background)
                    .await
                {
                    Ok(()) => {
                        info!(namespace = %namespace, name = %name, "Deleted finished child pod");
                        stats.pods_deleted += 1;
                    }
                    Err(source) => {
                        self.deps.reporter.report(&ReconcileError::DeleteChild {
                            namespace: namespace.clone(),
                            name: name.clone(),
                            source,
                        });
                        stats.delete_failures += 1;
                    }
                }
            }
        }

        if stats.pods_deleted > 0 || stats.delete_failures > 0 {
            info!(
                tasks_scanned = stats.tasks_scanned,
                pods_deleted = stats.pods_deleted,
                delete_failures = stats.delete_failures,
                "Cleanup pass complete"
            );
        } else {
            debug!(tasks_scanned = stats.tasks_scanned, "Cleanup pass found nothing to delete");
        }

        stats
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let retention = TimeDelta::from_std(self.config.child_retention).unwrap_or(TimeDelta::MAX);
        now.checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// A pod without a start time never expires.
fn started_before(pod: &Pod, cutoff: DateTime<Utc>) -> bool {
    pod.status.start_time.is_some_and(|start| start < cutoff)
}
