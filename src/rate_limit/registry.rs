//! Registry of token buckets keyed by partition.
//!
//! Buckets are created lazily on first use and removed by an idle sweep. The map is sharded
//! (`DashMap`), and each bucket carries its own lock, so admission on one key never waits on
//! admission for another.

use crate::clock::{default_clock, Clock};
use crate::config::LimiterConfig;
use crate::error::ConfigError;
use crate::rate_limit::{Decision, RateLimiter, TokenBucket};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Per-partition token buckets sharing one [`LimiterConfig`].
#[derive(Debug)]
pub struct RateLimitRegistry {
    buckets: DashMap<String, Arc<TokenBucket>>,
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimitRegistry {
    /// Create a registry, validating the bucket sizing.
    pub fn new(config: LimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { buckets: DashMap::new(), config, clock: default_clock() })
    }

    /// Override the clock (useful for deterministic tests).
    ///
    /// Existing buckets keep the clock they were created with.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Admit one request for `partition`, creating its bucket on first use.
    pub fn is_allowed(&self, partition: &str) -> bool {
        self.check(partition).is_allowed()
    }

    /// Tokens left for `partition`; a never-seen key reports a full bucket.
    pub fn remaining(&self, partition: &str) -> u32 {
        self.existing(partition)
            .map(|bucket| bucket.available_tokens())
            .unwrap_or(self.config.burst_capacity)
    }

    /// Seconds until `partition` can be admitted again; a never-seen key reports `0`.
    pub fn seconds_until_reset(&self, partition: &str) -> u64 {
        self.existing(partition).map(|bucket| bucket.seconds_until_next_token()).unwrap_or(0)
    }

    /// Drop every bucket not accessed within `idle`. Returns how many were removed.
    ///
    /// A request holding a bucket while it is removed finishes against its own handle; the
    /// next request for that key starts a fresh, full bucket.
    pub fn cleanup_expired(&self, idle: Duration) -> usize {
        let now = self.clock.now_millis();
        let idle_millis = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        let before = self.buckets.len();
        self.buckets.retain(|key, bucket| {
            let keep = now.saturating_sub(bucket.last_access_millis()) < idle_millis;
            if !keep {
                trace!(target: "tollgate::rate_limit", partition = %key, "expiring idle bucket");
            }
            keep
        });
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(target: "tollgate::rate_limit", removed, "removed idle rate limit buckets");
        }
        removed
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Sizing applied to new buckets.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Remove every bucket.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    fn existing(&self, partition: &str) -> Option<Arc<TokenBucket>> {
        self.buckets.get(partition).map(|entry| entry.value().clone())
    }

    fn bucket(&self, partition: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.existing(partition) {
            return bucket;
        }
        self.buckets
            .entry(partition.to_string())
            .or_insert_with(|| {
                debug!(
                    target: "tollgate::rate_limit",
                    partition,
                    capacity = self.config.burst_capacity,
                    requests_per_minute = self.config.requests_per_minute,
                    "creating rate limit bucket"
                );
                Arc::new(TokenBucket::from_config(&self.config, self.clock.clone()))
            })
            .value()
            .clone()
    }
}

impl RateLimiter for RateLimitRegistry {
    fn check(&self, partition: &str) -> Decision {
        // The map guard is released before the bucket lock is taken.
        let bucket = self.bucket(partition);
        bucket.touch();
        bucket.acquire()
    }
}

/// Periodically run [`RateLimitRegistry::cleanup_expired`] on a tokio timer.
///
/// The task runs until aborted; dropping the handle detaches it.
pub fn spawn_idle_sweeper(
    registry: Arc<RateLimitRegistry>,
    interval: Duration,
    idle: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            registry.cleanup_expired(idle);
        }
    })
}
