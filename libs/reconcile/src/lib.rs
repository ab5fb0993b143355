//! Work queue primitives for reconcile loops.
//!
//! This library provides the queue discipline a level-triggered controller
//! relies on. Key concepts:
//!
//! - **Key**: a small identity (usually `namespace/name`) standing for an
//!   object whose state should be re-read and converged.
//! - **Dirty / in flight**: a key is dirty while it waits to be processed
//!   and in flight between `get` and `done`.
//! - **Rate limiting**: failed keys are re-added after a per-key
//!   exponential backoff, combined with an overall token bucket.
//!
//! # Invariants
//!
//! - A key is queued at most once, no matter how often it is added
//! - A key is never handed to two consumers at the same time
//! - A key added while in flight is redelivered once after `done`

mod queue;
mod rate_limiter;

use std::time::Duration;

pub use queue::{QueueItem, WorkQueue};
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};

/// First retry delay for a failing key.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Backoff ceiling for a failing key.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Overall retry rate across all keys.
pub const DEFAULT_QPS: f64 = 10.0;

/// Overall retry burst across all keys.
pub const DEFAULT_BURST: u32 = 100;
