//! Cache-aside storage for expensive upstream lookups.
//!
//! - [`CacheKey`] / [`CacheDomain`]: deterministic, domain-scoped keys such as
//!   `token-1-0xABC`.
//! - [`CacheStore`]: async get-or-compute with a caller-chosen TTL per entry. Failures are
//!   never stored.
//!
//! The store never initiates work on its own: it only runs the `compute` closure handed to it
//! on a miss.

pub mod key;
pub mod store;
pub use key::{CacheDomain, CacheKey, CacheKeyBuilder};
pub use store::{spawn_eviction_sweeper, CacheStats, CacheStatus, CacheStore};
