#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Admission control and cache-aside middleware for services that fan out to rate-limited,
//! expensive upstream APIs.
//!
//! ## Features
//!
//! - **Token-bucket rate limiting** per partition key, with lazily created buckets and an
//!   idle sweep
//! - **Cache-aside store** with a TTL chosen per call, and failures never cached
//! - **Deterministic cache keys** scoped by data domain (`token-1-0xABC`)
//! - **Dispatcher** composing admission, caching and metrics around any async operation
//! - **Metric events** delivered to pluggable `tower::Service` sinks
//! - **Tower layer** for wrapping existing services
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{CacheKey, CachePolicy, Dispatcher, LogSink, TollgateConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TollgateConfig::default();
//!     let dispatcher = Dispatcher::from_config(&config, LogSink)?;
//!
//!     let key = CacheKey::price(1, ["0xA", "0xB"], "USD");
//!     let policy = CachePolicy::for_domain(key, &config.cache_ttls);
//!     let prices = dispatcher
//!         .dispatch_cached("prices", policy, || async {
//!             // Call the upstream API here
//!             Ok::<_, std::io::Error>(vec![1.0_f64, 0.99])
//!         })
//!         .await?;
//!     assert_eq!(prices.len(), 2);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod layer;
pub mod prelude;
pub mod rate_limit;
pub mod telemetry;

// Re-exports
pub use cache::{CacheDomain, CacheKey, CacheStats, CacheStatus, CacheStore};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{CacheTtls, LimiterConfig, TollgateConfig};
pub use dispatcher::{CachePolicy, Dispatcher, Sweepers};
pub use error::{ConfigError, DispatchError};
pub use layer::{DispatchKey, DispatchLayer, DispatchService};
pub use rate_limit::{Decision, RateLimitRegistry, RateLimiter, TokenBucket};
pub use telemetry::{
    CounterSink, LogSink, MemorySink, MetricEvent, MetricsSink, MetricsSnapshot, NullSink,
};
