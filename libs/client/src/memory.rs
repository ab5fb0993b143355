//! In-process cluster.
//!
//! `MemoryCluster` implements every capability the controller consumes
//! against plain maps. It assigns uids and resource versions like a real
//! API server, broadcasts watch events, records each call made through
//! the capability traits, and can be told to fail the next call of a verb.
//!
//! Methods prefixed `put_`/`remove_`/`set_` act as an outside party (a
//! user or the kubelet) and are neither recorded nor subject to injected
//! failures.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use taskrun_api::core_v1::{Pod, PodPhase};
use taskrun_api::v1::Task;
use taskrun_api::{ObjectKey, ObjectList, Resource, Selector, WatchEvent};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::api::{ListWatch, PodApi, PropagationPolicy, TaskApi, WatchStream};
use crate::error::ApiError;

const WATCH_BUFFER: usize = 1024;
const HISTORY_LIMIT: usize = 4096;

/// Operation kinds, for call recording and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Delete,
    Watch,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
    pub propagation: Option<PropagationPolicy>,
}

struct Collection<T> {
    items: BTreeMap<ObjectKey, T>,
    history: VecDeque<WatchEvent<T>>,
    events: broadcast::Sender<WatchEvent<T>>,
}

impl<T: Resource + Clone> Collection<T> {
    fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            items: BTreeMap::new(),
            history: VecDeque::new(),
            events,
        }
    }

    fn emit(&mut self, event: WatchEvent<T>) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(event.clone());
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct Journal {
    calls: Vec<Call>,
    failures: HashMap<Verb, VecDeque<ApiError>>,
}

/// Types stored by the cluster.
trait Stored: Resource + Clone + PartialEq + Send + Sync + 'static {
    fn collection(cluster: &MemoryCluster) -> &Mutex<Collection<Self>>;
}

impl Stored for Task {
    fn collection(cluster: &MemoryCluster) -> &Mutex<Collection<Self>> {
        &cluster.tasks
    }
}

impl Stored for Pod {
    fn collection(cluster: &MemoryCluster) -> &Mutex<Collection<Self>> {
        &cluster.pods
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory cluster API.
pub struct MemoryCluster {
    tasks: Mutex<Collection<Task>>,
    pods: Mutex<Collection<Pod>>,
    journal: Mutex<Journal>,
    resource_version: AtomicU64,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Collection::new()),
            pods: Mutex::new(Collection::new()),
            journal: Mutex::new(Journal::default()),
            resource_version: AtomicU64::new(0),
        }
    }

    /// Makes the next call of `verb` fail with `err`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, verb: Verb, err: ApiError) {
        lock(&self.journal)
            .failures
            .entry(verb)
            .or_default()
            .push_back(err);
    }

    /// Calls made through the capability traits, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.journal).calls.clone()
    }

    /// Recorded calls of one verb.
    pub fn calls_for(&self, verb: Verb) -> Vec<Call> {
        lock(&self.journal)
            .calls
            .iter()
            .filter(|c| c.verb == verb)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.journal).calls.clear();
    }

    /// Creates or replaces a task as an outside party.
    pub fn put_task(&self, task: Task) -> Task {
        self.put(task)
    }

    /// Creates or replaces a pod as an outside party.
    pub fn put_pod(&self, pod: Pod) -> Pod {
        self.put(pod)
    }

    pub fn remove_task(&self, namespace: &str, name: &str) -> Option<Task> {
        self.remove::<Task>(namespace, name)
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.remove::<Pod>(namespace, name)
    }

    /// Moves a pod to `phase`, as the kubelet would.
    pub fn set_pod_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: PodPhase,
        start_time: Option<DateTime<Utc>>,
    ) -> Option<Pod> {
        let mut pod = self.pod(namespace, name)?;
        pod.status.phase = phase;
        pod.status.start_time = start_time;
        Some(self.put(pod))
    }

    pub fn task(&self, namespace: &str, name: &str) -> Option<Task> {
        lock(&self.tasks)
            .items
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        lock(&self.pods)
            .items
            .get(&ObjectKey::new(namespace, name))
            .cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        lock(&self.tasks).items.values().cloned().collect()
    }

    pub fn pods(&self) -> Vec<Pod> {
        lock(&self.pods).items.values().cloned().collect()
    }

    fn next_resource_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn current_resource_version(&self) -> String {
        self.resource_version.load(Ordering::SeqCst).to_string()
    }

    /// Records a call and pops an injected failure for its verb, if any.
    fn record<T: Resource>(
        &self,
        verb: Verb,
        namespace: &str,
        name: &str,
        propagation: Option<PropagationPolicy>,
    ) -> Result<(), ApiError> {
        let mut journal = lock(&self.journal);
        journal.calls.push(Call {
            verb,
            kind: T::KIND,
            namespace: namespace.to_string(),
            name: name.to_string(),
            propagation,
        });

        match journal.failures.get_mut(&verb).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn put<T: Stored>(&self, mut obj: T) -> T {
        let mut collection = lock(T::collection(self));
        let key = ObjectKey::new(obj.meta().namespace.clone(), obj.meta().name.clone());
        let existing = collection.items.get(&key).map(|o| o.meta().clone());
        let replacing = existing.is_some();

        let meta = obj.meta_mut();
        match existing {
            Some(old) => {
                meta.uid = old.uid;
                meta.creation_timestamp = old.creation_timestamp;
            }
            None => {
                if meta.uid.is_empty() {
                    meta.uid = uuid::Uuid::new_v4().to_string();
                }
                meta.creation_timestamp.get_or_insert_with(Utc::now);
            }
        }
        meta.resource_version = self.next_resource_version();

        collection.items.insert(key, obj.clone());
        let event = if replacing {
            WatchEvent::Modified(obj.clone())
        } else {
            WatchEvent::Added(obj.clone())
        };
        collection.emit(event);
        obj
    }

    fn remove<T: Stored>(&self, namespace: &str, name: &str) -> Option<T> {
        let mut collection = lock(T::collection(self));
        let mut obj = collection.items.remove(&ObjectKey::new(namespace, name))?;
        obj.meta_mut().resource_version = self.next_resource_version();
        collection.emit(WatchEvent::Deleted(obj.clone()));
        Some(obj)
    }

    fn create<T: Stored>(&self, namespace: &str, obj: &T) -> Result<T, ApiError> {
        let name = obj.meta().name.clone();
        self.record::<T>(Verb::Create, namespace, &name, None)?;
        if name.is_empty() {
            return Err(ApiError::Status {
                code: 422,
                message: "metadata.name is required".to_string(),
            });
        }

        let mut collection = lock(T::collection(self));
        let key = ObjectKey::new(namespace, name.clone());
        if collection.items.contains_key(&key) {
            return Err(ApiError::already_exists(T::KIND, &name));
        }

        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        meta.namespace = namespace.to_string();
        meta.uid = uuid::Uuid::new_v4().to_string();
        meta.resource_version = self.next_resource_version();
        meta.creation_timestamp = Some(Utc::now());

        collection.items.insert(key, obj.clone());
        collection.emit(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    fn update<T: Stored>(&self, namespace: &str, obj: &T) -> Result<T, ApiError> {
        let name = obj.meta().name.clone();
        self.record::<T>(Verb::Update, namespace, &name, None)?;

        let mut collection = lock(T::collection(self));
        let key = ObjectKey::new(namespace, name.clone());
        let current = collection
            .items
            .get(&key)
            .ok_or_else(|| ApiError::not_found(T::KIND, &name))?;

        let requested = &obj.meta().resource_version;
        if !requested.is_empty() && requested != &current.meta().resource_version {
            return Err(ApiError::Conflict(format!(
                "{} {:?} was modified (have {}, got {})",
                T::KIND,
                name,
                current.meta().resource_version,
                requested
            )));
        }

        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        meta.namespace = namespace.to_string();
        meta.uid = current.meta().uid.clone();
        meta.creation_timestamp = current.meta().creation_timestamp;
        meta.resource_version = current.meta().resource_version.clone();

        // Writing back an unchanged object is a no-op, as on a real server.
        if &obj == current {
            return Ok(obj);
        }
        obj.meta_mut().resource_version = self.next_resource_version();

        collection.items.insert(key, obj.clone());
        collection.emit(WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }

    fn delete<T: Stored>(
        &self,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<(), ApiError> {
        self.record::<T>(Verb::Delete, namespace, name, Some(propagation))?;
        self.remove::<T>(namespace, name)
            .map(|_| ())
            .ok_or_else(|| ApiError::not_found(T::KIND, name))
    }

    fn get<T: Stored>(&self, namespace: &str, name: &str) -> Result<T, ApiError> {
        self.record::<T>(Verb::Get, namespace, name, None)?;
        lock(T::collection(self))
            .items
            .get(&ObjectKey::new(namespace, name))
            .cloned()
            .ok_or_else(|| ApiError::not_found(T::KIND, name))
    }

    fn list<T: Stored>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<ObjectList<T>, ApiError> {
        self.record::<T>(Verb::List, namespace.unwrap_or_default(), "", None)?;
        let collection = lock(T::collection(self));
        let items = collection
            .items
            .iter()
            .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace == ns))
            .filter(|(_, obj)| selector.matches(&obj.meta().labels))
            .map(|(_, obj)| obj.clone())
            .collect();
        Ok(ObjectList::new(self.current_resource_version(), items))
    }

    fn watch_stream<T: Stored>(&self, resource_version: &str) -> Result<WatchStream<T>, ApiError> {
        self.record::<T>(Verb::Watch, "", "", None)?;
        let since: u64 = resource_version.parse().unwrap_or(0);

        // Replay and subscription happen under the same lock, so no event
        // can fall between them.
        let collection = lock(T::collection(self));
        let replay: Vec<Result<WatchEvent<T>, ApiError>> = collection
            .history
            .iter()
            .filter(|e| e.resource_version().parse::<u64>().unwrap_or(0) > since)
            .cloned()
            .map(Ok)
            .collect();
        let live = BroadcastStream::new(collection.events.subscribe()).map(|event| {
            event.map_err(|e| ApiError::Status {
                code: 410,
                message: e.to_string(),
            })
        });

        Ok(futures_util::stream::iter(replay).chain(live).boxed())
    }
}

#[async_trait]
impl TaskApi for MemoryCluster {
    async fn get_task(&self, namespace: &str, name: &str) -> Result<Task, ApiError> {
        self.get(namespace, name)
    }

    async fn list_tasks(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<Task>, ApiError> {
        Ok(self.list(namespace, selector)?.items)
    }

    async fn update_task(&self, namespace: &str, task: &Task) -> Result<Task, ApiError> {
        self.update(namespace, task)
    }
}

#[async_trait]
impl PodApi for MemoryCluster {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ApiError> {
        self.create(namespace, pod)
    }

    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>, ApiError> {
        Ok(self.list(Some(namespace), selector)?.items)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<(), ApiError> {
        self.delete::<Pod>(namespace, name, propagation)
    }
}

#[async_trait]
impl ListWatch<Task> for MemoryCluster {
    async fn list_all(&self) -> Result<ObjectList<Task>, ApiError> {
        self.list(None, &Selector::everything())
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<Task>, ApiError> {
        self.watch_stream(resource_version)
    }
}

#[async_trait]
impl ListWatch<Pod> for MemoryCluster {
    async fn list_all(&self) -> Result<ObjectList<Pod>, ApiError> {
        self.list(None, &Selector::everything())
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<Pod>, ApiError> {
        self.watch_stream(resource_version)
    }
}
