//! Asynchronous get-or-compute store with per-entry TTL.
//!
//! Semantics:
//! - A live entry (`now - stored_at < ttl`) is returned without running `compute`.
//! - On a miss `compute` runs; only an `Ok` result is stored, with `stored_at = now` and the
//!   TTL supplied by the caller for that call.
//! - Expired entries are treated as absent and removed on the lookup that finds them;
//!   [`CacheStore::purge_expired`] and [`spawn_eviction_sweeper`] remove them eagerly.
//! - Values are stored type-erased. Asking for a key with a different type than was stored is
//!   a miss, and the fill overwrites the entry.
//!
//! Concurrent misses on one key each run `compute` by default, and the last write to finish
//! wins the slot. [`CacheStore::with_single_flight`] serializes misses per key instead: the
//! first caller computes while the rest wait and then re-check the store. A failed compute is
//! still not stored, so the next waiter computes again.

use crate::clock::{default_clock, Clock};
use dashmap::DashMap;
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Whether a lookup was served from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// Point-in-time counters for a [`CacheStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries currently held, including expired ones not yet evicted.
    pub entries: usize,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    stored_at_millis: u64,
    ttl_millis: u64,
}

impl CacheEntry {
    fn is_live(&self, now: u64) -> bool {
        now.saturating_sub(self.stored_at_millis) < self.ttl_millis
    }
}

/// Concurrent cache-aside store keyed by rendered [`CacheKey`](crate::cache::CacheKey)s.
#[derive(Debug)]
pub struct CacheStore {
    entries: DashMap<String, CacheEntry>,
    in_flight: Option<Arc<DashMap<String, Arc<Mutex<()>>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Empty store on the monotonic clock, without miss coalescing.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            clock: default_clock(),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Coalesce concurrent misses on the same key into a single `compute`.
    pub fn with_single_flight(mut self) -> Self {
        self.in_flight = Some(Arc::new(DashMap::new()));
        self
    }

    pub fn is_single_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Return the live value for `key`, or run `compute` and store its success for `ttl`.
    pub async fn get_or_compute<V, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<V, E>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.get_or_compute_with_status(key, ttl, compute).await.1
    }

    /// Like [`get_or_compute`](Self::get_or_compute), also reporting whether it was a hit.
    pub async fn get_or_compute_with_status<V, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> (CacheStatus, Result<V, E>)
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get::<V>(key) {
            return self.hit(key, value);
        }

        let _flight = match &self.in_flight {
            Some(locks) => {
                let flight = InFlight::join(locks, key).await;
                // Whoever held the slot before us may have filled it.
                if let Some(value) = self.get::<V>(key) {
                    return self.hit(key, value);
                }
                Some(flight)
            }
            None => None,
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(target: "tollgate::cache", key, "cache miss");

        let result = compute().await;
        match &result {
            Ok(value) => {
                self.insert(key, value.clone(), ttl);
                let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
                debug!(target: "tollgate::cache", key, ttl_ms, "cache filled");
            }
            Err(_) => {
                debug!(target: "tollgate::cache", key, "compute failed; nothing stored");
            }
        }
        (CacheStatus::Miss, result)
    }

    /// Live value for `key`, if one of type `V` is stored. Expired entries are evicted.
    pub fn get<V>(&self, key: &str) -> Option<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        let now = self.clock.now_millis();
        // The shard guard is released at the end of this statement, before any removal.
        let live = match self.entries.get(key) {
            Some(entry) => entry.is_live(now).then(|| entry.value.clone()),
            None => return None,
        };
        match live {
            Some(value) => value.downcast_ref::<V>().cloned(),
            None => {
                // Only evict if nobody refreshed the slot since we looked.
                self.entries.remove_if(key, |_, entry| !entry.is_live(now));
                None
            }
        }
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    pub fn insert<V>(&self, key: impl Into<String>, value: V, ttl: Duration)
    where
        V: Send + Sync + 'static,
    {
        let entry = CacheEntry {
            value: Arc::new(value),
            stored_at_millis: self.clock.now_millis(),
            ttl_millis: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        };
        self.entries.insert(key.into(), entry);
    }

    /// Remove `key`. Returns whether an entry was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every expired entry. Returns how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(target: "tollgate::cache", evicted, "purged expired cache entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    fn hit<V, E>(&self, key: &str, value: V) -> (CacheStatus, Result<V, E>) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        trace!(target: "tollgate::cache", key, "cache hit");
        (CacheStatus::Hit, Ok(value))
    }
}

/// Holds a key's single-flight slot; releasing it drops the per-key lock once unused.
struct InFlight {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl InFlight {
    async fn join(locks: &Arc<DashMap<String, Arc<Mutex<()>>>>, key: &str) -> Self {
        let lock = locks.entry(key.to_string()).or_default().value().clone();
        let guard = lock.lock_owned().await;
        Self { locks: locks.clone(), key: key.to_string(), guard: Some(guard) }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        drop(self.guard.take());
        // The map's own handle is the last one once no caller is waiting on the slot.
        self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Periodically run [`CacheStore::purge_expired`] on a tokio timer.
pub fn spawn_eviction_sweeper(cache: Arc<CacheStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            cache.purge_expired();
        }
    })
}
