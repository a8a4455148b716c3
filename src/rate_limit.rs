//! Rate limiting primitives.
//!
//! This module provides the building blocks for admission control:
//! - [`TokenBucket`]: a single capped counter with timed refill.
//! - [`RateLimitRegistry`]: one bucket per partition key, created on first use and dropped
//!   after a period of inactivity.
//! - [`RateLimiter`]: the seam the [`Dispatcher`](crate::Dispatcher) asks for admission.
//! - [`Decision`]: the result of an admission check (Allowed/Denied).
//!
//! # Architecture
//!
//! - **Logic**: `TokenBucket` (in `bucket`) handles refill math with integer tokens.
//! - **State**: `RateLimitRegistry` (in `registry`) owns the buckets in a sharded map so that
//!   unrelated keys never contend on a single lock.
//! - **Maintenance**: [`spawn_idle_sweeper`] evicts idle buckets on a background timer.

use std::time::Duration;

pub mod bucket;
pub mod registry;
pub use bucket::TokenBucket;
pub use registry::{spawn_idle_sweeper, RateLimitRegistry};

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Number of tokens left in the bucket after this admission.
        remaining: u32,
    },
    /// The request is denied.
    Denied {
        /// How long the caller should wait before retrying.
        retry_after: Duration,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Admission control keyed by partition.
///
/// Implementations must make each check a short, non-blocking critical section; the
/// dispatcher calls this on every request.
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Attempt to admit one request for `partition`.
    fn check(&self, partition: &str) -> Decision;
}
