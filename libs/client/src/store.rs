//! Thread-safe local object cache.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use taskrun_api::{ObjectKey, Resource, Selector};

/// Local mirror of one object type, keyed by namespace/name.
///
/// Written only by an informer; read by listers. Objects are shared as
/// `Arc<T>` and must be treated as immutable.
#[derive(Debug)]
pub struct Store<T> {
    items: RwLock<HashMap<ObjectKey, Arc<T>>>,
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Resource> Store<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<T>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Inserts or replaces an object, returning the previous version.
    ///
    /// Objects without a name are ignored.
    pub fn upsert(&self, obj: Arc<T>) -> Option<Arc<T>> {
        let key = ObjectKey::from_meta(obj.meta()).ok()?;
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, obj)
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<T>> {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Replaces the whole content, returning what was there before.
    pub fn replace(&self, objs: Vec<Arc<T>>) -> HashMap<ObjectKey, Arc<T>> {
        let next: HashMap<ObjectKey, Arc<T>> = objs
            .into_iter()
            .filter_map(|obj| ObjectKey::from_meta(obj.meta()).ok().map(|key| (key, obj)))
            .collect();

        std::mem::replace(
            &mut *self.items.write().unwrap_or_else(PoisonError::into_inner),
            next,
        )
    }

    /// Every cached object, in no particular order.
    pub fn list(&self) -> Vec<Arc<T>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Objects in `namespace` (all namespaces for `None`) whose labels
    /// match `selector`.
    pub fn list_matching(&self, namespace: Option<&str>, selector: &Selector) -> Vec<Arc<T>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace == ns))
            .filter(|(_, obj)| selector.matches(&obj.meta().labels))
            .map(|(_, obj)| Arc::clone(obj))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
