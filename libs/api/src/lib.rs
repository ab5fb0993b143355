//! # taskrun-api
//!
//! Object model shared by the taskrun controller and its clients.
//!
//! ## Resources
//!
//! - [`v1::Task`]: the user-declared unit of work (`taskrun.dev/v1`).
//! - [`core_v1::Pod`]: the short-lived child process created for a task.
//!
//! ## Design Principles
//!
//! - Objects are identified by a namespaced key (`namespace/name`)
//! - Ownership is declared with controller owner references and checked by uid
//! - Types are registered explicitly in a [`Scheme`] at process start; the
//!   scheme is then passed by reference to every encode/decode call

mod error;
mod key;
mod macros;
mod meta;
mod scheme;
mod selector;
mod watch;

pub mod core_v1;
pub mod v1;

pub use error::{KeyError, SchemeError};
pub use key::ObjectKey;
pub use meta::{
    controller_of, controller_ref, is_controlled_by, ListMeta, ObjectList, ObjectMeta,
    OwnerReference, Resource,
};
pub use scheme::{GroupVersionKind, Scheme};
pub use selector::Selector;
pub use watch::WatchEvent;
