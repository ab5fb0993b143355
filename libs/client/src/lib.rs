//! # taskrun-client
//!
//! Everything the controller uses to talk to the cluster:
//!
//! - [`TaskApi`] / [`PodApi`]: narrow write-capable capabilities
//! - [`TaskLister`] / [`PodLister`]: reads against the local cache
//! - [`Store`] and [`Informer`]: the list+watch fed local cache
//! - [`HttpClient`]: REST implementation of the capabilities
//! - [`MemoryCluster`]: in-process implementation for tests and demos

mod api;
mod error;
mod http;
mod informer;
mod lister;
mod memory;
mod store;

pub use api::{ListWatch, PodApi, PropagationPolicy, TaskApi, WatchStream};
pub use error::{ApiError, CacheError};
pub use http::{ClientConfig, HttpClient};
pub use informer::{
    wait_for_cache_sync, DeletedFinalStateUnknown, Delta, HasSynced, Informer,
    ResourceEventHandler,
};
pub use lister::{PodLister, TaskLister};
pub use memory::{Call, MemoryCluster, Verb};
pub use store::Store;
