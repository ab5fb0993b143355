//! Capability traits over the cluster API.
//!
//! The controller never sees a concrete client; it receives these narrow
//! traits at construction time so tests can substitute in-memory fakes.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use taskrun_api::core_v1::Pod;
use taskrun_api::v1::Task;
use taskrun_api::{ObjectList, Selector, WatchEvent};

use crate::error::ApiError;

/// How dependents of a deleted object are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropagationPolicy {
    /// Leave dependents in place.
    Orphan,
    /// Delete the object now, dependents asynchronously.
    Background,
    /// Delete dependents first, then the object.
    Foreground,
}

/// Child pod operations.
#[async_trait]
pub trait PodApi: Send + Sync {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ApiError>;

    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>, ApiError>;

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<(), ApiError>;
}

/// Parent task operations.
#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn get_task(&self, namespace: &str, name: &str) -> Result<Task, ApiError>;

    /// Lists tasks in `namespace`, or in every namespace for `None`.
    async fn list_tasks(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<Task>, ApiError>;

    async fn update_task(&self, namespace: &str, task: &Task) -> Result<Task, ApiError>;
}

/// Stream of changes following a list.
pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>, ApiError>>;

/// Source feeding an informer: a consistent list, then changes after it.
#[async_trait]
pub trait ListWatch<T>: Send + Sync {
    /// Lists every object across all namespaces.
    async fn list_all(&self) -> Result<ObjectList<T>, ApiError>;

    /// Streams changes newer than `resource_version`.
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<T>, ApiError>;
}
