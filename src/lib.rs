//! hcache - Herd-protected distributed caching library
//!
//! This library fronts a remote memcached-compatible key/value store and
//! guarantees that, for any given key, at most one value computation is in
//! flight locally at a time, even under concurrent demand.
//!
//! The cache supports:
//! - Per-key coalescing of concurrent computations (single-flight)
//! - A stale-value fallback tier that serves a slightly-older copy while a
//!   fresh value is being computed
//! - Bounded in-flight tracking with LRU eviction
//! - Configurable TTLs, timeouts and key canonicalization
//! - Pluggable backend client, key hasher and metric sink
//! - Degraded local-only coalescing while the backend is unreachable

mod backend;
mod cache;
mod config;
mod error;
mod in_flight;
mod keys;
mod metrics;

pub use backend::{BackendError, CacheBackend};
pub use cache::{
    CACHE_TYPE_CACHE_DISABLED, CACHE_TYPE_DISTRIBUTED_CACHE, CACHE_TYPE_STALE_CACHE,
    CACHE_TYPE_STALE_VALUE_CALCULATION, CACHE_TYPE_VALUE_CALCULATION, Cacheable, ComputationError,
    HerdCache,
};
pub use config::CacheConfig;
pub use error::CacheError;
pub use keys::{AHashKeyHasher, IdentityHasher, KeyHasher};
pub use metrics::{MetricRecorder, NoOpMetricRecorder};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
