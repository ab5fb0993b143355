//! Garbage collection of finished child pods.
//!
//! A pod is removed once it is controlled by a known task, has succeeded,
//! and started longer ago than the retention window. Failed pods and pods
//! of deleted tasks are left alone.

mod worker;

pub use worker::{CleanupWorker, CleanupWorkerConfig, CleanupWorkerDeps, SweepStats};
