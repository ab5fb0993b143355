//! Watch stream events.

use crate::meta::Resource;

/// One change notification from a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Progress marker carrying only a resource version.
    Bookmark { resource_version: String },
}

impl<T: Resource> WatchEvent<T> {
    /// Resource version this event advances the stream to.
    pub fn resource_version(&self) -> &str {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                &obj.meta().resource_version
            }
            WatchEvent::Bookmark { resource_version } => resource_version,
        }
    }
}
