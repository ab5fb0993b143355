//! taskrun controller library.
//!
//! This crate primarily ships the `taskrun-controller` binary, but exposes
//! its pieces so the end-to-end tests can wire them against an in-memory
//! cluster.

pub mod cleanup;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
pub mod reconciler;

pub use controller::{Controller, ControllerConfig, ControllerDeps};
pub use error::{ControllerError, ErrorReporter, ReconcileError};
pub use reconciler::{Outcome, Reconciler};
