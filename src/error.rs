//! Error types for admission control, caching, and configuration
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error returned from a dispatched call.
///
/// A denial and an upstream failure are separate variants so callers can back off on the
/// former and treat the latter as a hard error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError<E> {
    /// Admission was denied; the operation was never invoked
    RateLimited { partition: String, retry_after: Duration, remaining: u32 },
    /// The wrapped operation failed; propagated unchanged and never cached
    Upstream(E),
}

impl<E: fmt::Display> fmt::Display for DispatchError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { partition, retry_after, .. } => {
                write!(f, "rate limit exceeded for '{}' (retry after {:?})", partition, retry_after)
            }
            Self::Upstream(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for DispatchError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Upstream(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}

impl<E> DispatchError<E> {
    /// Check if this error is an admission denial
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
    /// Check if this error came from the wrapped operation
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }
    /// How long the caller should wait before retrying, for denials.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            Self::Upstream(_) => None,
        }
    }
    /// Get the upstream error if this is an Upstream variant
    pub fn into_upstream(self) -> Option<E> {
        match self {
            Self::Upstream(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
    /// Borrow the upstream error if present.
    pub fn as_upstream(&self) -> Option<&E> {
        match self {
            Self::Upstream(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}

/// Startup-time configuration failures. Fatal to process start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("requests_per_minute must be > 0 (got {provided})")]
    InvalidRequestsPerMinute { provided: u32 },
    #[error("burst_capacity must be > 0 (got {provided})")]
    InvalidBurstCapacity { provided: u32 },
    #[error("ttl for cache domain '{domain}' must be > 0")]
    InvalidTtl { domain: &'static str },
    #[error("{field} must be > 0")]
    InvalidDuration { field: &'static str },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}
