//! Read access to the local cache.

use std::sync::Arc;

use taskrun_api::core_v1::Pod;
use taskrun_api::v1::Task;
use taskrun_api::{ObjectKey, Selector};

use crate::error::CacheError;
use crate::store::Store;

/// Cached task reads.
pub trait TaskLister: Send + Sync {
    /// Looks a task up by namespace and name. `Ok(None)` means not found.
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Task>>, CacheError>;

    /// Lists tasks in every namespace.
    fn list(&self, selector: &Selector) -> Result<Vec<Arc<Task>>, CacheError>;
}

/// Cached pod reads.
pub trait PodLister: Send + Sync {
    fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<Arc<Pod>>, CacheError>;
}

impl TaskLister for Store<Task> {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Task>>, CacheError> {
        Ok(self.get_by_key(&ObjectKey::new(namespace, name)))
    }

    fn list(&self, selector: &Selector) -> Result<Vec<Arc<Task>>, CacheError> {
        Ok(self.list_matching(None, selector))
    }
}

impl PodLister for Store<Pod> {
    fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<Arc<Pod>>, CacheError> {
        Ok(self.list_matching(Some(namespace), selector))
    }
}
