use super::events::{AdmissionEvent, CacheEvent, MetricEvent, RequestOutcome};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A sink that consumes metric events.
pub trait MetricsSink:
    tower::Service<MetricEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: MetricEvent)
where
    S: tower::Service<MetricEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// A no-op sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<MetricEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: MetricEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl MetricsSink for NullSink {
    type SinkError = Infallible;
}

/// A sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<MetricEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: MetricEvent) -> Self::Future {
        tracing::info!(target: "tollgate::metrics", event = %event, "metric_event");
        Box::pin(async { Ok(()) })
    }
}

impl MetricsSink for LogSink {
    type SinkError = Infallible;
}

/// A sink that stores events in memory, evicting the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<MetricEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MetricEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<MetricEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: MetricEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl MetricsSink for MemorySink {
    type SinkError = Infallible;
}

/// Counter values captured by [`CounterSink::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub request_total: u64,
    pub request_success: u64,
    pub request_failure: u64,
    pub rate_limit_hit: u64,
    pub cache_hit: u64,
    pub cache_miss: u64,
    /// Number of latency samples recorded.
    pub latency_count: u64,
    pub latency_total: Duration,
    pub latency_max: Duration,
}

impl MetricsSnapshot {
    /// Mean latency over all samples, or zero if none were recorded.
    pub fn latency_mean(&self) -> Duration {
        if self.latency_count == 0 {
            return Duration::ZERO;
        }
        let mean = self.latency_total.as_micros() / u128::from(self.latency_count);
        Duration::from_micros(u64::try_from(mean).unwrap_or(u64::MAX))
    }
}

#[derive(Debug, Default)]
struct Counters {
    request_total: AtomicU64,
    request_success: AtomicU64,
    request_failure: AtomicU64,
    rate_limit_hit: AtomicU64,
    cache_hit: AtomicU64,
    cache_miss: AtomicU64,
    latency_count: AtomicU64,
    latency_total_micros: AtomicU64,
    latency_max_micros: AtomicU64,
}

/// Aggregates events into the counters of the metrics contract.
///
/// Clones share the same counters, so a clone handed to a dispatcher can be read back from
/// the original.
#[derive(Clone, Debug, Default)]
pub struct CounterSink {
    counters: Arc<Counters>,
}

impl CounterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        MetricsSnapshot {
            request_total: c.request_total.load(Ordering::Relaxed),
            request_success: c.request_success.load(Ordering::Relaxed),
            request_failure: c.request_failure.load(Ordering::Relaxed),
            rate_limit_hit: c.rate_limit_hit.load(Ordering::Relaxed),
            cache_hit: c.cache_hit.load(Ordering::Relaxed),
            cache_miss: c.cache_miss.load(Ordering::Relaxed),
            latency_count: c.latency_count.load(Ordering::Relaxed),
            latency_total: Duration::from_micros(c.latency_total_micros.load(Ordering::Relaxed)),
            latency_max: Duration::from_micros(c.latency_max_micros.load(Ordering::Relaxed)),
        }
    }

    fn record(&self, event: &MetricEvent) {
        let c = &self.counters;
        match event {
            MetricEvent::Admission(AdmissionEvent::Admitted { .. }) => {
                c.request_total.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::Admission(AdmissionEvent::Denied { .. }) => {
                c.rate_limit_hit.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::Cache(CacheEvent::Hit { .. }) => {
                c.cache_hit.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::Cache(CacheEvent::Miss { .. }) => {
                c.cache_miss.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::Request(outcome) => {
                match outcome {
                    RequestOutcome::Success { .. } => {
                        c.request_success.fetch_add(1, Ordering::Relaxed)
                    }
                    RequestOutcome::Failure { .. } => {
                        c.request_failure.fetch_add(1, Ordering::Relaxed)
                    }
                };
                let micros = u64::try_from(outcome.duration().as_micros()).unwrap_or(u64::MAX);
                c.latency_count.fetch_add(1, Ordering::Relaxed);
                c.latency_total_micros.fetch_add(micros, Ordering::Relaxed);
                c.latency_max_micros.fetch_max(micros, Ordering::Relaxed);
            }
        }
    }
}

impl Service<MetricEvent> for CounterSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: MetricEvent) -> Self::Future {
        self.record(&event);
        Box::pin(async { Ok(()) })
    }
}

impl MetricsSink for CounterSink {
    type SinkError = Infallible;
}

/// Offloads emission to a bounded channel and worker task.
///
/// Events that do not fit in the channel are dropped and counted. Must be constructed inside
/// a tokio runtime.
#[derive(Clone)]
pub struct NonBlockingSink<S> {
    tx: tokio::sync::mpsc::Sender<MetricEvent>,
    dropped: Arc<AtomicU64>,
    _sink: std::marker::PhantomData<fn() -> S>,
}

impl<S> NonBlockingSink<S>
where
    S: tower::Service<MetricEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    pub fn with_capacity(sink: S, capacity: usize) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let mut sink = sink;

        tokio::spawn(async move {
            use tower::ServiceExt;
            while let Some(event) = rx.recv().await {
                if let Ok(ready) = sink.ready().await {
                    let _ = ready.call(event).await;
                }
            }
        });

        Self { tx, dropped: Arc::new(AtomicU64::new(0)), _sink: std::marker::PhantomData }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<S> std::fmt::Debug for NonBlockingSink<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingSink").field("dropped", &self.dropped).finish()
    }
}

impl<S> tower::Service<MetricEvent> for NonBlockingSink<S>
where
    S: tower::Service<MetricEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: MetricEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl<S> MetricsSink for NonBlockingSink<S>
where
    S: tower::Service<MetricEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    type SinkError = Infallible;
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Which side of a [`MulticastSink`] rejected an event.
///
/// Both sides always receive the event; when both fail, the primary's error is reported.
#[derive(Debug, thiserror::Error)]
pub enum MulticastError {
    #[error("primary metrics sink failed: {0}")]
    Primary(#[source] BoxError),
    #[error("secondary metrics sink failed: {0}")]
    Secondary(#[source] BoxError),
}

/// Delivers every event to a primary and a secondary sink.
///
/// Each side is driven to readiness on its own clone before the event is handed over, so
/// sinks that apply backpressure (a `ConcurrencyLimit`, a `Buffer`) are safe to fan out to.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    primary: A,
    secondary: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(primary: A, secondary: B) -> Self {
        Self { primary, secondary }
    }
}

async fn deliver<S>(sink: S, event: MetricEvent) -> Result<(), BoxError>
where
    S: tower::Service<MetricEvent, Response = ()>,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let mut ready = tower::ServiceExt::ready_oneshot(sink).await?;
    ready.call(event).await?;
    Ok(())
}

impl<A, B> Service<MetricEvent> for MulticastSink<A, B>
where
    A: tower::Service<MetricEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<MetricEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = MulticastError;
    type Future = SinkFuture<Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is acquired per event on the clones taken in `call`.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: MetricEvent) -> Self::Future {
        let primary = deliver(self.primary.clone(), event.clone());
        let secondary = deliver(self.secondary.clone(), event);
        Box::pin(async move {
            let (primary, secondary) = tokio::join!(primary, secondary);
            primary.map_err(MulticastError::Primary)?;
            secondary.map_err(MulticastError::Secondary)
        })
    }
}

impl<A, B> MetricsSink for MulticastSink<A, B>
where
    A: tower::Service<MetricEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<MetricEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = MulticastError;
}
