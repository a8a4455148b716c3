//! Convenient re-exports for common Tollgate types.
pub use crate::{
    cache::{CacheDomain, CacheKey, CacheStore},
    clock::{Clock, ManualClock},
    config::{CacheTtls, LimiterConfig, TollgateConfig},
    dispatcher::{CachePolicy, Dispatcher},
    error::{ConfigError, DispatchError},
    layer::{DispatchKey, DispatchLayer},
    rate_limit::{Decision, RateLimitRegistry, RateLimiter},
    telemetry::{CounterSink, LogSink, MetricEvent, MetricsSink, NullSink},
};
