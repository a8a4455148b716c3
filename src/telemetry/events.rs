use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Metric events emitted by the dispatcher.
///
/// Each event maps onto one counter of the metrics contract:
///
/// | event                         | counter                           |
/// |-------------------------------|-----------------------------------|
/// | `Admission(Admitted)`         | `requestTotal`                    |
/// | `Admission(Denied)`           | `rateLimitHit`                    |
/// | `Cache(Hit)`                  | `cacheHit`                        |
/// | `Cache(Miss)`                 | `cacheMiss`                       |
/// | `Request(Success)`            | `requestSuccess` + latency sample |
/// | `Request(Failure)`            | `requestFailure` + latency sample |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricEvent {
    /// Rate limiter decisions
    Admission(AdmissionEvent),
    /// Cache lookups
    Cache(CacheEvent),
    /// Completed operations
    Request(RequestOutcome),
}

/// Outcome of the admission check for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// The partition had a token; the call proceeds.
    Admitted {
        /// Partition key of the call
        partition: String,
    },
    /// The partition was out of tokens; the operation was not invoked.
    Denied {
        /// Partition key of the call
        partition: String,
        /// Time until the partition's next token
        retry_after: Duration,
    },
}

/// Result of a cache lookup made for an admitted call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Hit { key: String },
    Miss { key: String },
}

/// Completion of an admitted call, emitted once the result resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The call resolved with a value (cached or computed).
    Success {
        partition: String,
        /// Time from admission to resolution
        duration: Duration,
    },
    /// The call resolved with an upstream error.
    Failure {
        partition: String,
        /// Time from admission to resolution
        duration: Duration,
    },
}

impl RequestOutcome {
    pub fn duration(&self) -> Duration {
        match self {
            RequestOutcome::Success { duration, .. } | RequestOutcome::Failure { duration, .. } => {
                *duration
            }
        }
    }

    pub fn partition(&self) -> &str {
        match self {
            RequestOutcome::Success { partition, .. }
            | RequestOutcome::Failure { partition, .. } => partition,
        }
    }
}

impl MetricEvent {
    pub(crate) fn admitted(partition: &str) -> Self {
        MetricEvent::Admission(AdmissionEvent::Admitted { partition: partition.to_string() })
    }

    pub(crate) fn denied(partition: &str, retry_after: Duration) -> Self {
        MetricEvent::Admission(AdmissionEvent::Denied {
            partition: partition.to_string(),
            retry_after,
        })
    }

    pub(crate) fn cache_hit(key: &str) -> Self {
        MetricEvent::Cache(CacheEvent::Hit { key: key.to_string() })
    }

    pub(crate) fn cache_miss(key: &str) -> Self {
        MetricEvent::Cache(CacheEvent::Miss { key: key.to_string() })
    }

    pub(crate) fn completed(partition: &str, succeeded: bool, duration: Duration) -> Self {
        let partition = partition.to_string();
        MetricEvent::Request(if succeeded {
            RequestOutcome::Success { partition, duration }
        } else {
            RequestOutcome::Failure { partition, duration }
        })
    }
}

impl fmt::Display for MetricEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricEvent::Admission(event) => write!(f, "Admission::{}", event),
            MetricEvent::Cache(event) => write!(f, "Cache::{}", event),
            MetricEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Admitted { partition } => write!(f, "Admitted({})", partition),
            AdmissionEvent::Denied { partition, retry_after } => {
                write!(f, "Denied({}, retry_after={:?})", partition, retry_after)
            }
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEvent::Hit { key } => write!(f, "Hit({})", key),
            CacheEvent::Miss { key } => write!(f, "Miss({})", key),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { partition, duration } => {
                write!(f, "Success({}, duration={:?})", partition, duration)
            }
            RequestOutcome::Failure { partition, duration } => {
                write!(f, "Failure({}, duration={:?})", partition, duration)
            }
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a MetricEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &MetricEvent) -> serde_json::Value {
    match event {
        MetricEvent::Admission(a) => match a {
            AdmissionEvent::Admitted { partition } => json!({
                "kind": "request_total",
                "partition": partition,
            }),
            AdmissionEvent::Denied { partition, retry_after } => json!({
                "kind": "rate_limit_hit",
                "partition": partition,
                "retry_after_ms": clamp_u64(retry_after.as_millis()),
            }),
        },
        MetricEvent::Cache(c) => match c {
            CacheEvent::Hit { key } => json!({ "kind": "cache_hit", "key": key }),
            CacheEvent::Miss { key } => json!({ "kind": "cache_miss", "key": key }),
        },
        MetricEvent::Request(r) => match r {
            RequestOutcome::Success { partition, duration } => json!({
                "kind": "request_success",
                "partition": partition,
                "duration_ms": clamp_u64(duration.as_millis()),
            }),
            RequestOutcome::Failure { partition, duration } => json!({
                "kind": "request_failure",
                "partition": partition,
                "duration_ms": clamp_u64(duration.as_millis()),
            }),
        },
    }
}
