//! List+watch driven cache with change notifications.
//!
//! An [`Informer`] keeps a [`Store`] in sync with the cluster and tells
//! registered handlers what changed:
//!
//! 1. List everything, replace the store, mark the informer synced
//! 2. Watch from the list's resource version, applying each event
//! 3. On watch failure or expiry, pause and go back to 1
//!
//! Objects that vanish between two lists are reported as deleted with a
//! [`DeletedFinalStateUnknown`] tombstone, since their final state was
//! never observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use taskrun_api::{ObjectKey, Resource, WatchEvent};
use tokio::sync::watch;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

use crate::api::ListWatch;
use crate::store::Store;

/// Pause before relisting after a failed list or a closed watch.
const RELIST_BACKOFF: Duration = Duration::from_secs(1);

/// How often [`wait_for_cache_sync`] re-checks readiness.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Last known state of an object whose deletion was missed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedFinalStateUnknown<T> {
    pub key: String,
    pub obj: Option<T>,
}

/// Payload of a delete notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta<T> {
    /// The object as last seen by the watch.
    Live(T),
    /// The object was already gone when the informer noticed.
    Tombstone(DeletedFinalStateUnknown<T>),
}

/// Receives change notifications from an [`Informer`].
///
/// Called synchronously from the informer task; implementations should only
/// enqueue work.
pub trait ResourceEventHandler<T>: Send + Sync {
    fn on_add(&self, obj: &Arc<T>);

    fn on_update(&self, old: &Arc<T>, new: &Arc<T>);

    fn on_delete(&self, obj: Delta<Arc<T>>);
}

/// Readiness of a cache.
pub trait HasSynced: Send + Sync {
    /// True once the first full list has been stored.
    fn has_synced(&self) -> bool;
}

/// Keeps a [`Store`] of `T` in sync with a [`ListWatch`] source.
pub struct Informer<T> {
    source: Arc<dyn ListWatch<T>>,
    store: Arc<Store<T>>,
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler<T>>>>,
    synced: AtomicBool,
    resync: Option<Duration>,
}

impl<T> Informer<T>
where
    T: Resource + Send + Sync + 'static,
{
    /// Creates an informer. A non-zero `resync` re-delivers every cached
    /// object as an update on that period.
    pub fn new(source: Arc<dyn ListWatch<T>>, resync: Duration) -> Self {
        Self {
            source,
            store: Arc::new(Store::new()),
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
            resync: (!resync.is_zero()).then_some(resync),
        }
    }

    pub fn store(&self) -> Arc<Store<T>> {
        Arc::clone(&self.store)
    }

    /// Registers a handler. Handlers added after the first list only see
    /// later changes.
    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<T>>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Runs list+watch until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(kind = T::KIND, "Starting informer");

        let mut resync = self
            .resync
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.source.list_all().await {
                Ok(list) => {
                    let count = list.items.len();
                    self.replace(list.items);
                    if !self.synced.swap(true, Ordering::SeqCst) {
                        info!(kind = T::KIND, count, "Informer cache synced");
                    }

                    if self
                        .watch_from(list.metadata.resource_version, &mut resync, &mut shutdown)
                        .await
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!(kind = T::KIND, error = %e, "Failed to list objects");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RELIST_BACKOFF) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(kind = T::KIND, "Informer shutting down");
    }

    /// Follows the watch stream. Returns true on shutdown, false when the
    /// caller should relist.
    async fn watch_from(
        &self,
        mut resource_version: String,
        resync: &mut Option<Interval>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut stream = match self.source.watch(&resource_version).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(kind = T::KIND, error = %e, "Failed to start watch");
                return false;
            }
        };

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        resource_version = event.resource_version().to_string();
                        self.apply(event);
                    }
                    Some(Err(e)) => {
                        if e.is_gone() {
                            debug!(kind = T::KIND, %resource_version, "Watch expired, relisting");
                        } else {
                            warn!(kind = T::KIND, error = %e, "Watch failed");
                        }
                        return false;
                    }
                    None => {
                        debug!(kind = T::KIND, %resource_version, "Watch closed");
                        return false;
                    }
                },
                _ = next_resync(resync) => self.resync(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return true;
                    }
                }
            }
        }
    }

    fn handlers(&self) -> Vec<Arc<dyn ResourceEventHandler<T>>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, items: Vec<T>) {
        let items: Vec<Arc<T>> = items.into_iter().map(Arc::new).collect();
        let mut previous = self.store.replace(items.clone());
        let handlers = self.handlers();

        for obj in &items {
            let Ok(key) = ObjectKey::from_meta(obj.meta()) else {
                continue;
            };
            match previous.remove(&key) {
                Some(old) => handlers.iter().for_each(|h| h.on_update(&old, obj)),
                None => handlers.iter().for_each(|h| h.on_add(obj)),
            }
        }

        for (key, old) in previous {
            let tombstone = DeletedFinalStateUnknown {
                key: key.to_string(),
                obj: Some(old),
            };
            for h in &handlers {
                h.on_delete(Delta::Tombstone(tombstone.clone()));
            }
        }
    }

    fn apply(&self, event: WatchEvent<T>) {
        let handlers = self.handlers();

        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let obj = Arc::new(obj);
                match self.store.upsert(Arc::clone(&obj)) {
                    Some(old) => handlers.iter().for_each(|h| h.on_update(&old, &obj)),
                    None => handlers.iter().for_each(|h| h.on_add(&obj)),
                }
            }
            WatchEvent::Deleted(obj) => {
                if let Ok(key) = ObjectKey::from_meta(obj.meta()) {
                    self.store.remove(&key);
                }
                let obj = Arc::new(obj);
                for h in &handlers {
                    h.on_delete(Delta::Live(Arc::clone(&obj)));
                }
            }
            WatchEvent::Bookmark { .. } => {}
        }
    }

    fn resync(&self) {
        let handlers = self.handlers();
        let objs = self.store.list();
        debug!(kind = T::KIND, count = objs.len(), "Resyncing cached objects");

        for obj in &objs {
            handlers.iter().for_each(|h| h.on_update(obj, obj));
        }
    }
}

impl<T: Send + Sync> HasSynced for Informer<T> {
    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

async fn next_resync(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Waits until every cache has synced.
///
/// Returns false if shutdown is signaled first.
pub async fn wait_for_cache_sync(
    mut shutdown: watch::Receiver<bool>,
    caches: &[&dyn HasSynced],
) -> bool {
    let mut poll = tokio::time::interval(SYNC_POLL_INTERVAL);

    loop {
        if caches.iter().all(|c| c.has_synced()) {
            return true;
        }
        if *shutdown.borrow() {
            return false;
        }

        tokio::select! {
            _ = poll.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}
