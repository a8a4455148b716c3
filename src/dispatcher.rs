//! Admission control, cache-aside and metrics composed around one operation.
//!
//! Every dispatched call goes through the same steps:
//!
//! 1. The partition's bucket is charged. A denial returns [`DispatchError::RateLimited`]
//!    immediately; the operation is never invoked and only a `Denied` event is emitted.
//! 2. With a [`CachePolicy`], the operation becomes the `compute` of
//!    [`CacheStore::get_or_compute_with_status`]; otherwise it runs directly.
//! 3. Once the result resolves, exactly one `Success` or `Failure` event is emitted carrying
//!    the latency from admission to resolution.
//!
//! Operations always return a future. Synchronous producers go through
//! [`Dispatcher::dispatch_ready`], which lifts the value with `futures::future::ready`, so
//! there is a single completion path.
//!
//! ```rust
//! use tollgate::{CacheKey, CachePolicy, CounterSink, Dispatcher, TollgateConfig};
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let metrics = CounterSink::new();
//! let dispatcher = Dispatcher::from_config(&TollgateConfig::default(), metrics.clone())?;
//!
//! let policy = CachePolicy::new(CacheKey::token(1, "0xABC"), Duration::from_secs(3600));
//! let symbol = dispatcher
//!     .dispatch_cached("tokens", policy, || async { Ok::<_, std::io::Error>("USDC".to_string()) })
//!     .await
//!     .unwrap();
//! assert_eq!(symbol, "USDC");
//! assert_eq!(metrics.snapshot().cache_miss, 1);
//! # Ok::<_, tollgate::ConfigError>(())
//! # });
//! ```

use crate::cache::{spawn_eviction_sweeper, CacheKey, CacheStatus, CacheStore};
use crate::clock::{default_clock, Clock};
use crate::config::{CacheTtls, TollgateConfig};
use crate::error::{ConfigError, DispatchError};
use crate::rate_limit::{spawn_idle_sweeper, Decision, RateLimitRegistry, RateLimiter};
use crate::telemetry::{emit_best_effort, MetricEvent, MetricsSink};
use pin_project::pin_project;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Where and for how long a dispatched result is cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub key: CacheKey,
    pub ttl: Duration,
}

impl CachePolicy {
    pub fn new(key: CacheKey, ttl: Duration) -> Self {
        Self { key, ttl }
    }

    /// Use the configured TTL for the key's domain.
    pub fn for_domain(key: CacheKey, ttls: &CacheTtls) -> Self {
        let ttl = ttls.for_domain(key.domain());
        Self { key, ttl }
    }
}

/// Applies rate limiting, caching and metrics to caller-supplied operations.
///
/// The dispatcher holds no per-call state. Clones share the limiter, the cache and (for the
/// provided sinks) the metrics destination.
#[derive(Clone)]
pub struct Dispatcher<S> {
    limiter: Arc<dyn RateLimiter>,
    cache: Arc<CacheStore>,
    sink: S,
    clock: Arc<dyn Clock>,
}

impl<S> fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("limiter", &self.limiter)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<S> Dispatcher<S>
where
    S: MetricsSink,
    S::Future: Send + 'static,
{
    /// Assemble a dispatcher from explicitly constructed parts.
    pub fn new(limiter: Arc<dyn RateLimiter>, cache: Arc<CacheStore>, sink: S) -> Self {
        Self { limiter, cache, sink, clock: default_clock() }
    }

    /// Validate `config` and build a [`RateLimitRegistry`] and [`CacheStore`] from it.
    pub fn from_config(config: &TollgateConfig, sink: S) -> Result<Self, ConfigError> {
        Self::assemble(config, sink, default_clock()).map(|(dispatcher, _, _)| dispatcher)
    }

    /// Like [`from_config`](Self::from_config), with every component on `clock`.
    pub fn from_config_with_clock<C: Clock + 'static>(
        config: &TollgateConfig,
        sink: S,
        clock: C,
    ) -> Result<Self, ConfigError> {
        Self::assemble(config, sink, Arc::new(clock)).map(|(dispatcher, _, _)| dispatcher)
    }

    /// Like [`from_config`](Self::from_config), also starting the idle-bucket and cache
    /// eviction sweeps at `config.sweep_interval`. Must be called inside a tokio runtime.
    pub fn from_config_with_sweepers(
        config: &TollgateConfig,
        sink: S,
    ) -> Result<(Self, Sweepers), ConfigError> {
        let (dispatcher, registry, cache) = Self::assemble(config, sink, default_clock())?;
        let sweepers = Sweepers {
            idle_buckets: spawn_idle_sweeper(
                registry,
                config.sweep_interval,
                config.idle_bucket_expiry,
            ),
            expired_entries: spawn_eviction_sweeper(cache, config.sweep_interval),
        };
        Ok((dispatcher, sweepers))
    }

    fn assemble(
        config: &TollgateConfig,
        sink: S,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, Arc<RateLimitRegistry>, Arc<CacheStore>), ConfigError> {
        config.validate()?;
        let registry =
            Arc::new(RateLimitRegistry::new(config.limiter)?.with_shared_clock(clock.clone()));
        let cache = Arc::new(CacheStore::new().with_shared_clock(clock.clone()));
        let dispatcher = Self { limiter: registry.clone(), cache: cache.clone(), sink, clock };
        Ok((dispatcher, registry, cache))
    }

    /// Override the clock used for latency (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Run `op` under admission control for `partition`, without caching.
    pub async fn dispatch<T, E, F, Fut>(
        &self,
        partition: &str,
        op: F,
    ) -> Result<T, DispatchError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit(partition).await?;
        // The clock starts before `op` runs so its synchronous prefix is measured too.
        let (result, elapsed) = Timed::new(async move { op().await }, self.clock.clone()).await;
        self.complete(partition, result.is_ok(), elapsed).await;
        result.map_err(DispatchError::Upstream)
    }

    /// Run `op` under admission control, serving it from the cache when a live entry exists.
    pub async fn dispatch_cached<T, E, F, Fut>(
        &self,
        partition: &str,
        policy: CachePolicy,
        op: F,
    ) -> Result<T, DispatchError<E>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit(partition).await?;
        let key = policy.key.as_str();
        let lookup = self.cache.get_or_compute_with_status(key, policy.ttl, op);
        let ((status, result), elapsed) = Timed::new(lookup, self.clock.clone()).await;
        let event = match status {
            CacheStatus::Hit => MetricEvent::cache_hit(key),
            CacheStatus::Miss => MetricEvent::cache_miss(key),
        };
        emit_best_effort(self.sink.clone(), event).await;
        self.complete(partition, result.is_ok(), elapsed).await;
        result.map_err(DispatchError::Upstream)
    }

    /// [`dispatch_cached`](Self::dispatch_cached) when `cache` is set, else
    /// [`dispatch`](Self::dispatch).
    pub async fn dispatch_with<T, E, F, Fut>(
        &self,
        partition: &str,
        cache: Option<CachePolicy>,
        op: F,
    ) -> Result<T, DispatchError<E>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match cache {
            Some(policy) => self.dispatch_cached(partition, policy, op).await,
            None => self.dispatch(partition, op).await,
        }
    }

    /// Dispatch a synchronous producer. `f` runs only if admitted and the cache misses.
    pub async fn dispatch_ready<T, E, F>(
        &self,
        partition: &str,
        cache: Option<CachePolicy>,
        f: F,
    ) -> Result<T, DispatchError<E>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        self.dispatch_with(partition, cache, move || futures::future::ready(f())).await
    }

    async fn admit<E>(&self, partition: &str) -> Result<(), DispatchError<E>> {
        match self.limiter.check(partition) {
            Decision::Allowed { remaining } => {
                trace!(target: "tollgate::dispatch", partition, remaining, "admitted");
                emit_best_effort(self.sink.clone(), MetricEvent::admitted(partition)).await;
                Ok(())
            }
            Decision::Denied { retry_after } => {
                warn!(
                    target: "tollgate::dispatch",
                    partition,
                    retry_after_secs = retry_after.as_secs(),
                    "rate limit exceeded"
                );
                emit_best_effort(self.sink.clone(), MetricEvent::denied(partition, retry_after))
                    .await;
                Err(DispatchError::RateLimited {
                    partition: partition.to_string(),
                    retry_after,
                    remaining: 0,
                })
            }
        }
    }

    async fn complete(&self, partition: &str, succeeded: bool, elapsed: Duration) {
        emit_best_effort(self.sink.clone(), MetricEvent::completed(partition, succeeded, elapsed))
            .await;
    }
}

/// Background sweeps started by [`Dispatcher::from_config_with_sweepers`].
///
/// Both tasks are aborted when this is dropped.
#[derive(Debug)]
pub struct Sweepers {
    idle_buckets: JoinHandle<()>,
    expired_entries: JoinHandle<()>,
}

impl Sweepers {
    pub fn abort(&self) {
        self.idle_buckets.abort();
        self.expired_entries.abort();
    }
}

impl Drop for Sweepers {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Resolves to the inner output paired with the time from construction to completion.
#[pin_project]
struct Timed<F> {
    #[pin]
    inner: F,
    clock: Arc<dyn Clock>,
    started_millis: u64,
}

impl<F> Timed<F> {
    fn new(inner: F, clock: Arc<dyn Clock>) -> Self {
        let started_millis = clock.now_millis();
        Self { inner, clock, started_millis }
    }
}

impl<F: Future> Future for Timed<F> {
    type Output = (F::Output, Duration);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = std::task::ready!(this.inner.poll(cx));
        let elapsed = this.clock.now_millis().saturating_sub(*this.started_millis);
        Poll::Ready((output, Duration::from_millis(elapsed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheDomain;
    use crate::clock::ManualClock;
    use crate::config::LimiterConfig;
    use crate::telemetry::{AdmissionEvent, CacheEvent, CounterSink, MemorySink, RequestOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher(capacity: u32, rpm: u32) -> (Dispatcher<MemorySink>, MemorySink, ManualClock) {
        let clock = ManualClock::new();
        let config = TollgateConfig {
            limiter: LimiterConfig::new(rpm, capacity).unwrap(),
            ..TollgateConfig::default()
        };
        let sink = MemorySink::new();
        let dispatcher =
            Dispatcher::from_config_with_clock(&config, sink.clone(), clock.clone()).unwrap();
        (dispatcher, sink, clock)
    }

    #[test]
    fn cache_policy_picks_domain_ttl() {
        let ttls = CacheTtls::default();
        let policy = CachePolicy::for_domain(CacheKey::swap(1, "0xS", "0xD", "10"), &ttls);
        assert_eq!(policy.ttl, Duration::from_secs(10));
        assert_eq!(policy.key.domain(), CacheDomain::Swap);
    }

    #[test]
    fn from_config_rejects_invalid_limits() {
        let mut config = TollgateConfig::default();
        config.limiter.burst_capacity = 0;
        let err = Dispatcher::from_config(&config, CounterSink::new()).unwrap_err();
        assert_eq!(err, ConfigError::InvalidBurstCapacity { provided: 0 });
    }

    #[tokio::test]
    async fn denied_call_never_invokes_operation() {
        let (dispatcher, sink, _clock) = dispatcher(1, 60);
        let calls = AtomicUsize::new(0);
        let op = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(1u8)
        };
        assert!(dispatcher.dispatch("p", op).await.is_ok());
        let err = dispatcher.dispatch("p", op).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let events = sink.events();
        assert_eq!(
            events.last(),
            Some(&MetricEvent::Admission(AdmissionEvent::Denied {
                partition: "p".into(),
                retry_after: Duration::from_secs(1),
            }))
        );
        let outcomes = events.iter().filter(|e| matches!(e, MetricEvent::Request(_))).count();
        assert_eq!(outcomes, 1, "denials record no outcome");
    }

    #[tokio::test]
    async fn latency_spans_admission_to_resolution() {
        let (dispatcher, sink, clock) = dispatcher(5, 60);
        let result = dispatcher
            .dispatch("p", || async {
                clock.advance(Duration::from_millis(250));
                Err::<u8, _>("upstream down")
            })
            .await;
        assert_eq!(result.unwrap_err().into_upstream(), Some("upstream down"));
        assert_eq!(
            sink.events().last(),
            Some(&MetricEvent::Request(RequestOutcome::Failure {
                partition: "p".into(),
                duration: Duration::from_millis(250),
            }))
        );
    }

    #[tokio::test]
    async fn cached_dispatch_emits_cache_events() {
        let (dispatcher, sink, _clock) = dispatcher(5, 60);
        let policy = CachePolicy::new(CacheKey::token(1, "0xABC"), Duration::from_secs(60));
        for _ in 0..2 {
            let value = dispatcher
                .dispatch_cached("tokens", policy.clone(), || async { Ok::<_, ()>(7u32) })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        let cache_events: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MetricEvent::Cache(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(
            cache_events,
            vec![
                CacheEvent::Miss { key: "token-1-0xABC".into() },
                CacheEvent::Hit { key: "token-1-0xABC".into() },
            ]
        );
    }

    #[tokio::test]
    async fn ready_values_take_the_same_completion_path() {
        let (dispatcher, sink, clock) = dispatcher(5, 60);
        let value = dispatcher
            .dispatch_ready("p", None, || {
                clock.advance(Duration::from_millis(250));
                Ok::<_, ()>("now")
            })
            .await
            .unwrap();
        assert_eq!(value, "now");
        assert_eq!(
            sink.events(),
            vec![
                MetricEvent::admitted("p"),
                MetricEvent::completed("p", true, Duration::from_millis(250)),
            ]
        );
    }

    #[tokio::test]
    async fn synchronous_work_before_the_future_is_timed() {
        let (dispatcher, sink, clock) = dispatcher(5, 60);
        let value = dispatcher
            .dispatch("p", || {
                clock.advance(Duration::from_millis(400));
                async { Ok::<_, ()>(1u8) }
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(
            sink.events().last(),
            Some(&MetricEvent::completed("p", true, Duration::from_millis(400)))
        );
    }

    #[tokio::test]
    async fn cached_ready_values_are_timed_on_a_miss() {
        let (dispatcher, sink, clock) = dispatcher(5, 60);
        let policy = CachePolicy::new(CacheKey::balance(1, "0xW"), Duration::from_secs(30));
        dispatcher
            .dispatch_ready("p", Some(policy), || {
                clock.advance(Duration::from_millis(120));
                Ok::<_, ()>(3u64)
            })
            .await
            .unwrap();
        assert_eq!(
            sink.events().last(),
            Some(&MetricEvent::completed("p", true, Duration::from_millis(120)))
        );
    }

    #[tokio::test]
    async fn sweepers_stop_when_dropped() {
        let (dispatcher, sweepers) =
            Dispatcher::from_config_with_sweepers(&TollgateConfig::default(), CounterSink::new())
                .unwrap();
        assert!(dispatcher.dispatch("p", || async { Ok::<_, ()>(()) }).await.is_ok());
        sweepers.abort();
        drop(sweepers);
    }
}
