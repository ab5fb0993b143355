//! Deduplicating, rate-limited work queue.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::rate_limiter::RateLimiter;

#[derive(Debug)]
struct State<K> {
    /// Keys ready to be handed out, in arrival order.
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while in flight).
    dirty: HashSet<K>,
    /// Keys handed out by `get` and not yet `done`.
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    available: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

impl<K: Clone + Eq + Hash> Inner<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.available.notify_one();
        }
    }
}

/// Work queue holding one entry per key.
///
/// Cloning yields another handle to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Creates a named queue using `rate_limiter` for retries.
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Marks `key` as needing processing.
    ///
    /// A key that is already queued is not queued again. A key that is in
    /// flight is queued once its current processing is `done`.
    pub fn add(&self, key: K) {
        let mut state = self.inner.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(queue = %self.inner.name, key = ?key, "Key in flight, deferring");
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Adds `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Adds `key` after the rate limiter's delay for it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.rate_limiter.when(&key);
        debug!(
            queue = %self.inner.name,
            key = ?key,
            delay_ms = delay.as_millis() as u64,
            "Requeueing with backoff"
        );
        self.add_after(key, delay);
    }

    /// Clears the retry history of `key`.
    pub fn forget(&self, key: &K) {
        self.inner.rate_limiter.forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Waits for the next key.
    ///
    /// Returns `None` once the queue has been shut down and drained. The
    /// returned item marks the key in flight until it is dropped.
    pub async fn get(&self) -> Option<QueueItem<K>> {
        loop {
            let available = self.inner.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    // Another consumer may be waiting on a key queued behind this one
                    if !state.queue.is_empty() {
                        self.inner.available.notify_one();
                    }
                    return Some(QueueItem {
                        key,
                        inner: Arc::clone(&self.inner),
                    });
                }
                if state.shutting_down {
                    return None;
                }
            }

            available.await;
        }
    }

    /// Stops accepting keys. Queued keys are still handed out; `get`
    /// returns `None` afterwards.
    pub fn shut_down(&self) {
        let mut state = self.inner.lock();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        drop(state);

        debug!(queue = %self.inner.name, "Work queue shutting down");
        self.inner.available.notify_waiters();
    }

    pub fn shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A key handed out by [`WorkQueue::get`].
///
/// Dropping the item marks the key done, on every exit path.
pub struct QueueItem<K: Clone + Eq + Hash> {
    key: K,
    inner: Arc<Inner<K>>,
}

impl<K: Clone + Eq + Hash> QueueItem<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Clone + Eq + Hash> Deref for QueueItem<K> {
    type Target = K;

    fn deref(&self) -> &K {
        &self.key
    }
}

impl<K: Clone + Eq + Hash> Drop for QueueItem<K> {
    fn drop(&mut self) {
        self.inner.done(&self.key);
    }
}

impl<K: Clone + Eq + Hash + Debug> Debug for QueueItem<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueItem").field("key", &self.key).finish()
    }
}
