//! Metric events and the sinks that consume them.
//!
//! The dispatcher emits one [`MetricEvent`] per counter increment of the metrics contract:
//!
//! - **Admission**: `Admitted` (`requestTotal`), `Denied` (`rateLimitHit`)
//! - **Cache**: `Hit` (`cacheHit`), `Miss` (`cacheMiss`)
//! - **Request**: `Success` / `Failure` (`requestSuccess` / `requestFailure`), each carrying
//!   the latency sample from admission to resolution
//!
//! # Sinks
//!
//! A [`MetricsSink`] is a `tower::Service<MetricEvent>`, so sinks compose with standard tower
//! combinators and with each other ([`MulticastSink`], [`NonBlockingSink`]). Emission is
//! best-effort: a failing sink never changes the result of a dispatched call.
//!
//! ```rust
//! use tollgate::telemetry::{CounterSink, MetricEvent, AdmissionEvent};
//! use tower::{Service, ServiceExt};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let counters = CounterSink::new();
//! let mut sink = counters.clone();
//! sink.ready().await.unwrap()
//!     .call(MetricEvent::Admission(AdmissionEvent::Admitted { partition: "tokens".into() }))
//!     .await
//!     .unwrap();
//! assert_eq!(counters.snapshot().request_total, 1);
//! # });
//! ```

pub mod events;
pub mod sinks;

#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use events::{AdmissionEvent, CacheEvent, MetricEvent, RequestOutcome};
pub use sinks::{
    emit_best_effort, CounterSink, LogSink, MemorySink, MetricsSink, MetricsSnapshot,
    MulticastError, MulticastSink, NonBlockingSink, NullSink,
};
