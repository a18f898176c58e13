//! Cache configuration

use std::time::Duration;

/// Configuration for the herd-protected cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Expiry written to the backend for fresh entries
    pub time_to_live: Duration,
    /// Maximum number of in-flight computations tracked at once
    pub max_capacity: usize,
    /// How long a backend `get` for a fresh entry may take
    pub backend_get_timeout: Duration,
    /// How long a backend `get` for a stale entry may take; zero means
    /// `backend_get_timeout`
    pub stale_backend_get_timeout: Duration,
    /// Whether `apply` waits for the backend `set` before resolving
    pub wait_for_backend_set: bool,
    /// Upper bound on waiting for a backend `set`
    pub set_wait_duration: Duration,
    /// Upper bound on waiting for a backend `delete`; zero waits without bound
    pub wait_for_remove: Duration,
    /// Serve stale-namespace entries while a fresh value is being computed
    pub use_stale_cache: bool,
    /// Added to the per-call TTL for stale entries; zero means the configured
    /// `time_to_live` is added instead
    pub stale_ttl_additional: Duration,
    /// Namespace prefix for stale entries
    pub stale_cache_prefix: String,
    /// Bound for the stale in-flight table; zero means `max_capacity`
    pub stale_max_capacity: usize,
    /// Unclaim the in-flight slot before publishing the result, instead of after
    pub remove_in_flight_before_publish: bool,
    /// Optional prefix applied to every user key
    pub key_prefix: Option<String>,
    /// With a `key_prefix` set: hash `prefix ‖ key` when true, or prepend the
    /// prefix to the hashed key when false
    pub hash_key_prefix: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            time_to_live: Duration::from_secs(60),
            max_capacity: 1000,
            backend_get_timeout: Duration::from_millis(2500),
            stale_backend_get_timeout: Duration::ZERO,
            wait_for_backend_set: false,
            set_wait_duration: Duration::from_secs(2),
            wait_for_remove: Duration::ZERO,
            use_stale_cache: false,
            stale_ttl_additional: Duration::ZERO,
            stale_cache_prefix: "stale".to_owned(),
            stale_max_capacity: 0,
            remove_in_flight_before_publish: false,
            key_prefix: None,
            hash_key_prefix: true,
        }
    }
}

impl CacheConfig {
    /// Effective capacity of the stale in-flight table.
    pub(crate) fn effective_stale_capacity(&self) -> usize {
        if self.stale_max_capacity == 0 {
            self.max_capacity
        } else {
            self.stale_max_capacity
        }
    }

    /// Effective timeout for stale-namespace backend reads.
    pub(crate) fn effective_stale_get_timeout(&self) -> Duration {
        if self.stale_backend_get_timeout.is_zero() {
            self.backend_get_timeout
        } else {
            self.stale_backend_get_timeout
        }
    }

    /// Expiry for the stale entry written alongside a fresh entry with `ttl`.
    ///
    /// The stale entry always outlives the fresh one: with no configured
    /// addition the fresh TTL is added once more.
    pub(crate) fn stale_ttl(&self, ttl: Duration) -> Duration {
        if self.stale_ttl_additional.is_zero() {
            ttl + self.time_to_live
        } else {
            ttl + self.stale_ttl_additional
        }
    }
}
