//! Configuration for the admission-control and caching core.
//!
//! Every value here is validated before any registry or store is built; a config that fails
//! [`TollgateConfig::validate`] is a startup error, never a runtime one.

use crate::cache::CacheDomain;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;
const DEFAULT_BURST_CAPACITY: u32 = 10;
const DEFAULT_IDLE_BUCKET_EXPIRY: Duration = Duration::from_secs(60 * 60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Token bucket sizing shared by every partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Sustained refill rate, in tokens per minute.
    pub requests_per_minute: u32,
    /// Bucket capacity; the largest burst admitted after an idle period.
    pub burst_capacity: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            burst_capacity: DEFAULT_BURST_CAPACITY,
        }
    }
}

impl LimiterConfig {
    /// Create a config with validation.
    pub fn new(requests_per_minute: u32, burst_capacity: u32) -> Result<Self, ConfigError> {
        let cfg = Self { requests_per_minute, burst_capacity };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requests_per_minute == 0 {
            return Err(ConfigError::InvalidRequestsPerMinute { provided: 0 });
        }
        if self.burst_capacity == 0 {
            return Err(ConfigError::InvalidBurstCapacity { provided: 0 });
        }
        Ok(())
    }
}

/// Time-to-live per cache domain. Volatile data gets short TTLs, near-static data long ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtls {
    #[serde(with = "duration_secs")]
    pub token: Duration,
    #[serde(with = "duration_secs")]
    pub price: Duration,
    #[serde(with = "duration_secs")]
    pub portfolio: Duration,
    #[serde(with = "duration_secs")]
    pub balance: Duration,
    #[serde(with = "duration_secs")]
    pub history: Duration,
    #[serde(with = "duration_secs")]
    pub swap: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            token: Duration::from_secs(60 * 60),
            price: Duration::from_secs(30),
            portfolio: Duration::from_secs(60),
            balance: Duration::from_secs(30),
            history: Duration::from_secs(5 * 60),
            swap: Duration::from_secs(10),
        }
    }
}

impl CacheTtls {
    /// TTL assigned to entries of `domain`.
    pub fn for_domain(&self, domain: CacheDomain) -> Duration {
        match domain {
            CacheDomain::Token => self.token,
            CacheDomain::Price => self.price,
            CacheDomain::Portfolio => self.portfolio,
            CacheDomain::Balance => self.balance,
            CacheDomain::History => self.history,
            CacheDomain::Swap => self.swap,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for domain in CacheDomain::ALL {
            if self.for_domain(domain).is_zero() {
                return Err(ConfigError::InvalidTtl { domain: domain.as_str() });
            }
        }
        Ok(())
    }
}

/// Top-level configuration consumed by [`crate::Dispatcher::from_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TollgateConfig {
    pub limiter: LimiterConfig,
    pub cache_ttls: CacheTtls,
    /// Buckets untouched for this long are dropped by the idle sweep.
    #[serde(with = "duration_secs")]
    pub idle_bucket_expiry: Duration,
    /// How often background sweeps run.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterConfig::default(),
            cache_ttls: CacheTtls::default(),
            idle_bucket_expiry: DEFAULT_IDLE_BUCKET_EXPIRY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl TollgateConfig {
    /// Parse a JSON document and validate it. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: TollgateConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limiter.validate()?;
        self.cache_ttls.validate()?;
        if self.idle_bucket_expiry.is_zero() {
            return Err(ConfigError::InvalidDuration { field: "idle_bucket_expiry" });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidDuration { field: "sweep_interval" });
        }
        Ok(())
    }
}

/// Durations travel as whole seconds in serialized config.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = TollgateConfig::default();
        assert_eq!(cfg.limiter.requests_per_minute, 60);
        assert_eq!(cfg.limiter.burst_capacity, 10);
        assert_eq!(cfg.idle_bucket_expiry, Duration::from_secs(3600));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_rate_and_capacity() {
        assert_eq!(
            LimiterConfig::new(0, 10).unwrap_err(),
            ConfigError::InvalidRequestsPerMinute { provided: 0 }
        );
        assert_eq!(
            LimiterConfig::new(60, 0).unwrap_err(),
            ConfigError::InvalidBurstCapacity { provided: 0 }
        );
    }

    #[test]
    fn parses_partial_json_with_defaults() {
        let cfg = TollgateConfig::from_json_str(
            r#"{ "limiter": { "requests_per_minute": 120 }, "cache_ttls": { "swap": 5 } }"#,
        )
        .expect("valid config");
        assert_eq!(cfg.limiter.requests_per_minute, 120);
        assert_eq!(cfg.limiter.burst_capacity, 10);
        assert_eq!(cfg.cache_ttls.swap, Duration::from_secs(5));
        assert_eq!(cfg.cache_ttls.token, Duration::from_secs(3600));
    }

    #[test]
    fn json_validation_surfaces_invalid_values() {
        let err = TollgateConfig::from_json_str(r#"{ "limiter": { "burst_capacity": 0 } }"#)
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidBurstCapacity { provided: 0 });

        let err = TollgateConfig::from_json_str(r#"{ "cache_ttls": { "price": 0 } }"#).unwrap_err();
        assert_eq!(err, ConfigError::InvalidTtl { domain: "price" });

        let err = TollgateConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn ttl_lookup_by_domain() {
        let ttls = CacheTtls::default();
        assert_eq!(ttls.for_domain(CacheDomain::Swap), Duration::from_secs(10));
        assert!(ttls.for_domain(CacheDomain::Token) > ttls.for_domain(CacheDomain::Price));
    }
}
