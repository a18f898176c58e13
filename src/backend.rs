//! Remote cache backend interface
//!
//! The cache core talks to the remote tier exclusively through
//! [`CacheBackend`]: a narrow, typed get/set/delete/flush surface with a
//! per-operation timeout. Wire protocol, connection pooling and node
//! discovery all live behind implementations of this trait.

use std::time::Duration;

use async_trait::async_trait;

/// Error type produced by backend implementations.
///
/// The core never propagates these to callers; they are logged and the
/// operation degrades (reads become misses, writes are dropped).
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Typed client for a remote memcached-compatible key/value store.
///
/// Implementations own serialization and transport. All methods must be safe
/// for concurrent use.
#[async_trait]
pub trait CacheBackend<V>: Send + Sync + 'static {
    /// Fetch the value stored under `key`, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` on a miss. Errors are treated as misses by the
    /// core.
    async fn get(&self, key: &str, timeout: Duration) -> Result<Option<V>, BackendError>;

    /// Store `value` under `key` with the given expiry in seconds, where `0`
    /// means "no expiry".
    async fn set(&self, key: &str, ttl_seconds: u32, value: V) -> Result<bool, BackendError>;

    /// Remove the entry stored under `key`.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Drop every entry in the remote store.
    async fn flush(&self) -> Result<bool, BackendError>;

    /// Whether the remote store is currently reachable.
    ///
    /// May flip transiently; the cache reroutes to local-only coalescing
    /// while this reports `false`.
    fn is_available(&self) -> bool;

    /// Release connections and other client resources.
    fn shutdown(&self);
}

/// Encode a TTL as the backend's expiry seconds.
///
/// Sub-second durations truncate to `0`, which the memcached convention
/// reads as "no expiry".
pub(crate) fn expiry_seconds(ttl: Duration) -> u32 {
    let secs = ttl.as_secs();
    if secs >= 1 {
        secs.try_into().unwrap_or(u32::MAX)
    } else {
        0
    }
}
