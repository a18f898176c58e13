//! Herd-protected distributed cache
//!
//! This module provides the core cache engine:
//! - Per-key coalescing of concurrent value computations (single-flight)
//! - Two-tier fresh/stale lookup and write-back against the remote backend
//! - Bounded in-flight tracking with LRU eviction
//! - Degraded local-only coalescing while the backend is unavailable
//!
//! The cache holds no worker threads of its own: computations and
//! fire-and-forget backend writes run as spawned tasks on the ambient tokio
//! runtime, and backend I/O completes on the backend client's own
//! connections.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend::{CacheBackend, expiry_seconds};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::in_flight::{Claim, InFlightGuard, InFlightTable, PendingValue};
use crate::keys::{KeyBuilder, KeyHasher};
use crate::metrics::{MetricRecorder, NoOpMetricRecorder};

pub const CACHE_TYPE_VALUE_CALCULATION: &str = "value_calculation_cache";
pub const CACHE_TYPE_STALE_VALUE_CALCULATION: &str = "stale_value_calculation_cache";
pub const CACHE_TYPE_CACHE_DISABLED: &str = "disabled_cache";
pub const CACHE_TYPE_STALE_CACHE: &str = "stale_distributed_cache";
pub const CACHE_TYPE_DISTRIBUTED_CACHE: &str = "distributed_cache";

/// Error produced by a caller-supplied value computation.
pub type ComputationError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Herd-protected cache in front of a remote key/value backend.
///
/// For any key at most one value computation is in flight locally at a time;
/// concurrent demand coalesces onto it. With the stale tier enabled, callers
/// joining an in-flight computation are first served from the longer-lived
/// stale namespace in the backend, falling back to the fresh computation's
/// result.
///
/// Cloning is cheap and every clone shares the same in-flight state.
pub struct HerdCache<V, B, H>
where
    V: Cacheable,
    B: CacheBackend<V>,
    H: KeyHasher,
{
    core: Arc<CacheCore<V, B, H>>,
}

impl<V, B, H> Clone for HerdCache<V, B, H>
where
    V: Cacheable,
    B: CacheBackend<V>,
    H: KeyHasher,
{
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

struct CacheCore<V, B, H>
where
    V: Cacheable,
{
    backend: B,
    keys: KeyBuilder<H>,
    config: CacheConfig,
    fresh: InFlightTable<V>,
    stale: Option<InFlightTable<V>>,
    metrics: Arc<dyn MetricRecorder>,
    shut_down: AtomicBool,
}

impl<V, B, H> HerdCache<V, B, H>
where
    V: Cacheable,
    B: CacheBackend<V>,
    H: KeyHasher,
{
    /// Create a cache that discards metrics.
    pub fn new(backend: B, hasher: H, config: CacheConfig) -> Self {
        Self::with_metrics(backend, hasher, config, Arc::new(NoOpMetricRecorder))
    }

    /// Create a cache emitting metrics to the given recorder.
    pub fn with_metrics(
        backend: B,
        hasher: H,
        config: CacheConfig,
        metrics: Arc<dyn MetricRecorder>,
    ) -> Self {
        let fresh = InFlightTable::new(
            config.max_capacity,
            config.remove_in_flight_before_publish,
        );
        let stale = config.use_stale_cache.then(|| {
            InFlightTable::new(
                config.effective_stale_capacity(),
                config.remove_in_flight_before_publish,
            )
        });
        let keys = KeyBuilder::new(
            hasher,
            config.key_prefix.clone(),
            config.hash_key_prefix,
            config.stale_cache_prefix.clone(),
        );

        Self {
            core: Arc::new(CacheCore {
                backend,
                keys,
                config,
                fresh,
                stale,
                metrics,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Fetch the value for `key`, computing it with `compute` on a miss.
    ///
    /// Uses the configured `time_to_live` and caches every non-`None` value.
    pub async fn apply<F, Fut>(&self, key: &str, compute: F) -> Result<Option<Arc<V>>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, ComputationError>> + Send + 'static,
    {
        let ttl = self.core.config.time_to_live;
        self.apply_filtered(key, compute, ttl, |_| true).await
    }

    /// [`apply`](Self::apply) with a per-call backend expiry.
    pub async fn apply_with_ttl<F, Fut>(
        &self,
        key: &str,
        compute: F,
        ttl: Duration,
    ) -> Result<Option<Arc<V>>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, ComputationError>> + Send + 'static,
    {
        self.apply_filtered(key, compute, ttl, |_| true).await
    }

    /// [`apply`](Self::apply) with a per-call expiry and cacheability
    /// predicate.
    ///
    /// Values rejected by `can_cache` are still published to every coalesced
    /// caller but are never written to the backend.
    pub async fn apply_filtered<F, Fut, P>(
        &self,
        key: &str,
        compute: F,
        ttl: Duration,
        can_cache: P,
    ) -> Result<Option<Arc<V>>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, ComputationError>> + Send + 'static,
        P: FnOnce(&V) -> bool + Send + 'static,
    {
        self.ensure_running()?;

        let core = &self.core;
        let key = core.keys.canonical(key);

        if !core.backend.is_available() {
            warn!("cache is disabled");
            return self.schedule_local_computation(key, compute).await;
        }

        match core.fresh.claim(&key) {
            Claim::Joined(pending) => {
                core.log_cache_hit(&key, CACHE_TYPE_VALUE_CALCULATION);
                if let Some(stale_table) = &core.stale {
                    let stale_key = core.keys.stale(&key);
                    self.stale_lookup(stale_table, stale_key, pending).await
                } else {
                    pending.wait().await
                }
            }
            Claim::Owner(guard) => {
                core.log_cache_miss(&key, CACHE_TYPE_VALUE_CALCULATION);
                let cached = core
                    .get_from_distributed_cache(
                        &key,
                        core.config.backend_get_timeout,
                        CACHE_TYPE_DISTRIBUTED_CACHE,
                    )
                    .await;
                let observer = guard.observer();
                match cached {
                    Some(value) => guard.complete(Ok(Some(Arc::new(value)))),
                    None => {
                        debug!(key = %key, "computing value");
                        Arc::clone(core).spawn_computation(guard, key, ttl, compute, can_cache);
                    }
                }
                observer.wait().await
            }
        }
    }

    /// Read-only lookup: no computation is ever scheduled.
    ///
    /// Joins an in-flight computation if one exists (via the stale tier when
    /// enabled), otherwise consults the backend directly. Resolves to `None`
    /// on a miss.
    pub async fn get(&self, key: &str) -> Result<Option<Arc<V>>, CacheError> {
        self.ensure_running()?;

        let core = &self.core;
        let key = core.keys.canonical(key);

        if !core.backend.is_available() {
            warn!("cache is disabled");
            return match core.fresh.get(&key) {
                Some(pending) => {
                    core.log_cache_hit(&key, CACHE_TYPE_VALUE_CALCULATION);
                    pending.wait().await
                }
                None => {
                    core.log_cache_miss(&key, CACHE_TYPE_CACHE_DISABLED);
                    Ok(None)
                }
            };
        }

        match core.fresh.get(&key) {
            Some(pending) => {
                core.log_cache_hit(&key, CACHE_TYPE_VALUE_CALCULATION);
                if let Some(stale_table) = &core.stale {
                    let stale_key = core.keys.stale(&key);
                    self.stale_lookup(stale_table, stale_key, pending).await
                } else {
                    pending.wait().await
                }
            }
            None => {
                core.log_cache_miss(&key, CACHE_TYPE_VALUE_CALCULATION);
                let value = core
                    .get_from_distributed_cache(
                        &key,
                        core.config.backend_get_timeout,
                        CACHE_TYPE_DISTRIBUTED_CACHE,
                    )
                    .await;
                Ok(value.map(Arc::new))
            }
        }
    }

    /// Delete `key` from the backend, stale namespace first.
    ///
    /// Waits up to `wait_for_remove` per delete when configured, without
    /// bound otherwise. Backend faults are logged, never raised.
    pub async fn clear_key(&self, key: &str) -> Result<(), CacheError> {
        self.ensure_running()?;

        let core = &self.core;
        if !core.backend.is_available() {
            warn!("cache is disabled");
            return Ok(());
        }

        let key = core.keys.canonical(key);
        if core.config.use_stale_cache {
            let stale_key = core.keys.stale(&key);
            core.delete_from_distributed_cache(&stale_key, "stale cache")
                .await;
        }
        core.delete_from_distributed_cache(&key, "cache").await;
        Ok(())
    }

    /// Drop all in-flight tracking and flush the remote store.
    ///
    /// The flush is awaited when `wait_for_clear` is set or `wait_for_remove`
    /// is non-zero (which also bounds the wait); otherwise it completes in
    /// the background.
    pub async fn clear(&self, wait_for_clear: bool) -> Result<(), CacheError> {
        self.ensure_running()?;

        let core = &self.core;
        core.clear_in_flight_tables();

        if !core.backend.is_available() {
            return Ok(());
        }

        let wait = core.config.wait_for_remove;
        if wait_for_clear || !wait.is_zero() {
            if wait.is_zero() {
                if let Err(error) = core.backend.flush().await {
                    warn!(error = %error, "failed waiting for cache clear");
                }
            } else {
                match timeout(wait, core.backend.flush()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => warn!(error = %error, "failed waiting for cache clear"),
                    Err(_) => warn!("timed out waiting for cache clear"),
                }
            }
        } else {
            let core = Arc::clone(&self.core);
            tokio::spawn(async move {
                if let Err(error) = core.backend.flush().await {
                    warn!(error = %error, "background cache clear failed");
                }
            });
        }
        Ok(())
    }

    /// Shut the cache down: drop all in-flight tracking and release the
    /// backend client. Idempotent; every later operation is rejected.
    ///
    /// In-flight computations complete normally but their results are no
    /// longer reachable through the cache.
    pub fn shutdown(&self) {
        if self.core.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.clear_in_flight_tables();
        self.core.backend.shutdown();
    }

    fn ensure_running(&self) -> Result<(), CacheError> {
        if self.core.shut_down.load(Ordering::SeqCst) {
            Err(CacheError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Coalesce on the fresh table without touching the backend.
    ///
    /// Used while the backend reports unavailable: the computed value is
    /// published to every coalesced caller but cached nowhere.
    async fn schedule_local_computation<F, Fut>(
        &self,
        key: String,
        compute: F,
    ) -> Result<Option<Arc<V>>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, ComputationError>> + Send + 'static,
    {
        let core = &self.core;
        match core.fresh.claim(&key) {
            Claim::Joined(pending) => {
                core.log_cache_hit(&key, CACHE_TYPE_VALUE_CALCULATION);
                pending.wait().await
            }
            Claim::Owner(guard) => {
                core.log_cache_miss(&key, CACHE_TYPE_CACHE_DISABLED);
                let observer = guard.observer();
                tokio::spawn(async move {
                    match compute().await {
                        Ok(value) => guard.complete(Ok(value.map(Arc::new))),
                        Err(error) => guard.complete(Err(error.to_string())),
                    }
                });
                observer.wait().await
            }
        }
    }

    /// Serve a coalesced caller from the stale namespace, falling back to
    /// the in-flight fresh computation.
    async fn stale_lookup(
        &self,
        table: &InFlightTable<V>,
        stale_key: String,
        fresh: PendingValue<V>,
    ) -> Result<Option<Arc<V>>, CacheError> {
        let core = &self.core;

        match table.claim(&stale_key) {
            Claim::Joined(pending) => {
                core.log_cache_hit(&stale_key, CACHE_TYPE_STALE_VALUE_CALCULATION);
                pending.wait().await
            }
            Claim::Owner(guard) => {
                core.log_cache_miss(&stale_key, CACHE_TYPE_STALE_VALUE_CALCULATION);
                let observer = guard.observer();
                let core = Arc::clone(&self.core);
                tokio::spawn(async move {
                    let stale_timeout = core.config.effective_stale_get_timeout();
                    let cached = core
                        .get_from_distributed_cache(&stale_key, stale_timeout, CACHE_TYPE_STALE_CACHE)
                        .await;
                    match cached {
                        Some(value) => guard.complete(Ok(Some(Arc::new(value)))),
                        // Degrade to whatever the fresh computation produces.
                        None => match fresh.wait().await {
                            Ok(value) => guard.complete(Ok(value)),
                            Err(CacheError::Computation(message)) => guard.complete(Err(message)),
                            Err(_) => drop(guard),
                        },
                    }
                });
                observer.wait().await
            }
        }
    }
}

impl<V, B, H> CacheCore<V, B, H>
where
    V: Cacheable,
    B: CacheBackend<V>,
    H: KeyHasher,
{
    fn log_cache_hit(&self, key: &str, cache_type: &str) {
        self.metrics.cache_hit(cache_type);
        debug!(
            target: "hcache::hit_miss",
            r#"{{ "cachehit" : "{key}", "cachetype" : "{cache_type}"}}"#
        );
    }

    fn log_cache_miss(&self, key: &str, cache_type: &str) {
        self.metrics.cache_miss(cache_type);
        debug!(
            target: "hcache::hit_miss",
            r#"{{ "cachemiss" : "{key}", "cachetype" : "{cache_type}"}}"#
        );
    }

    /// Run the computation in a spawned task, write back on success and
    /// publish the outcome through the in-flight guard.
    fn spawn_computation<F, Fut, P>(
        self: Arc<Self>,
        guard: InFlightGuard<V>,
        key: String,
        ttl: Duration,
        compute: F,
        can_cache: P,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>, ComputationError>> + Send + 'static,
        P: FnOnce(&V) -> bool + Send + 'static,
    {
        tokio::spawn(async move {
            let core = self;
            let started = Instant::now();
            match compute().await {
                Ok(value) => {
                    core.metrics
                        .set_duration("value_calculation_time", started.elapsed());
                    match value.as_ref() {
                        Some(computed) => {
                            if can_cache(computed) {
                                Arc::clone(&core)
                                    .write_back(key, ttl, computed.clone())
                                    .await;
                            } else {
                                debug!(key = %key, "computed value not cacheable, skipping backend write");
                            }
                        }
                        None => {
                            debug!(key = %key, "computed value was empty, not storing");
                        }
                    }
                    core.metrics.increment_counter("value_calculation_success");
                    guard.complete(Ok(value.map(Arc::new)));
                }
                Err(error) => {
                    core.metrics.increment_counter("value_calculation_failure");
                    core.metrics
                        .set_duration("value_calculation", started.elapsed());
                    guard.complete(Err(error.to_string()));
                }
            }
        });
    }

    /// Write a computed value to the backend, stale namespace first.
    ///
    /// The stale write always completes (bounded) before the fresh write is
    /// issued, so a reader racing with this writer finds a stale hit. When
    /// `wait_for_backend_set` is off, both writes run in a background task
    /// and the caller resolves immediately.
    async fn write_back(self: Arc<Self>, key: String, ttl: Duration, value: V) {
        let stale_write = self
            .stale
            .is_some()
            .then(|| (self.keys.stale(&key), self.config.stale_ttl(ttl)));

        if self.config.wait_for_backend_set {
            if let Some((stale_key, stale_ttl)) = stale_write {
                self.write_to_distributed_cache(&stale_key, stale_ttl, value.clone())
                    .await;
            }
            self.write_to_distributed_cache(&key, ttl, value).await;
        } else {
            tokio::spawn(async move {
                if let Some((stale_key, stale_ttl)) = stale_write {
                    self.write_to_distributed_cache(&stale_key, stale_ttl, value.clone())
                        .await;
                }
                self.write_to_distributed_cache(&key, ttl, value).await;
            });
        }
    }

    /// One backend `set`, bounded by `set_wait_duration` and logged on
    /// failure.
    async fn write_to_distributed_cache(&self, key: &str, ttl: Duration, value: V) {
        self.metrics.increment_counter("distributed_cache_writes");
        let seconds = expiry_seconds(ttl);
        match timeout(self.config.set_wait_duration, self.backend.set(key, seconds, value)).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => warn!(key = %key, error = %error, "backend set failed"),
            Err(_) => warn!(key = %key, "timed out waiting for backend set"),
        }
    }

    /// One backend `get` with hit/miss logging and per-type metrics.
    /// Transport errors and timeouts degrade to a miss.
    async fn get_from_distributed_cache(
        &self,
        key: &str,
        get_timeout: Duration,
        cache_type: &str,
    ) -> Option<V> {
        let started = Instant::now();
        let value = match timeout(get_timeout, self.backend.get(key, get_timeout)).await {
            Ok(Ok(Some(value))) => {
                self.log_cache_hit(key, cache_type);
                Some(value)
            }
            Ok(Ok(None)) => {
                self.log_cache_miss(key, cache_type);
                None
            }
            Ok(Err(error)) => {
                warn!(key = %key, error = %error, "backend get failed");
                None
            }
            Err(_) => {
                warn!(key = %key, "timed out waiting for backend get");
                None
            }
        };
        self.metrics.increment_counter(cache_type);
        self.metrics.set_duration(cache_type, started.elapsed());
        value
    }

    /// One backend `delete`, waited on per `wait_for_remove`.
    async fn delete_from_distributed_cache(&self, key: &str, which: &str) {
        let wait = self.config.wait_for_remove;
        if wait.is_zero() {
            if let Err(error) = self.backend.delete(key).await {
                warn!(key = %key, error = %error, "failed waiting for {which} clear");
            }
        } else {
            match timeout(wait, self.backend.delete(key)).await {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => {
                    warn!(key = %key, error = %error, "failed waiting for {which} clear");
                }
                Err(_) => warn!(key = %key, "timed out waiting for {which} clear"),
            }
        }
    }

    fn clear_in_flight_tables(&self) {
        self.fresh.clear();
        if let Some(stale) = &self.stale {
            stale.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;
    use tokio::sync::Barrier;
    use tokio::time::sleep;

    use super::*;
    use crate::backend::BackendError;
    use crate::keys::IdentityHasher;

    #[derive(Default)]
    struct MockState {
        values: Mutex<HashMap<String, String>>,
        sets: Mutex<Vec<(String, u32, String)>>,
        deletes: Mutex<Vec<String>>,
        gets: AtomicUsize,
        flushes: AtomicUsize,
        shutdowns: AtomicUsize,
        available: AtomicBool,
        fail_gets: AtomicBool,
        set_delay: Mutex<Duration>,
    }

    /// In-memory backend recording every call.
    #[derive(Clone)]
    struct MockBackend {
        state: Arc<MockState>,
    }

    impl MockBackend {
        fn new() -> Self {
            let state = MockState::default();
            state.available.store(true, Ordering::SeqCst);
            Self {
                state: Arc::new(state),
            }
        }

        fn put(&self, key: &str, value: &str) {
            self.state
                .values
                .lock()
                .insert(key.to_owned(), value.to_owned());
        }

        fn sets(&self) -> Vec<(String, u32, String)> {
            self.state.sets.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl CacheBackend<String> for MockBackend {
        async fn get(&self, key: &str, _timeout: Duration) -> Result<Option<String>, BackendError> {
            self.state.gets.fetch_add(1, Ordering::SeqCst);
            if self.state.fail_gets.load(Ordering::SeqCst) {
                return Err("backend unreachable".into());
            }
            Ok(self.state.values.lock().get(key).cloned())
        }

        async fn set(&self, key: &str, ttl_seconds: u32, value: String) -> Result<bool, BackendError> {
            let delay = *self.state.set_delay.lock();
            if !delay.is_zero() {
                sleep(delay).await;
            }
            self.state
                .sets
                .lock()
                .push((key.to_owned(), ttl_seconds, value.clone()));
            self.state.values.lock().insert(key.to_owned(), value);
            Ok(true)
        }

        async fn delete(&self, key: &str) -> Result<bool, BackendError> {
            self.state.deletes.lock().push(key.to_owned());
            Ok(self.state.values.lock().remove(key).is_some())
        }

        async fn flush(&self) -> Result<bool, BackendError> {
            self.state.flushes.fetch_add(1, Ordering::SeqCst);
            self.state.values.lock().clear();
            Ok(true)
        }

        fn is_available(&self) -> bool {
            self.state.available.load(Ordering::SeqCst)
        }

        fn shutdown(&self) {
            self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingMetrics {
        hits: Mutex<Vec<String>>,
        misses: Mutex<Vec<String>>,
        counters: Mutex<Vec<String>>,
    }

    impl MetricRecorder for RecordingMetrics {
        fn cache_hit(&self, cache_type: &str) {
            self.hits.lock().push(cache_type.to_owned());
        }

        fn cache_miss(&self, cache_type: &str) {
            self.misses.lock().push(cache_type.to_owned());
        }

        fn increment_counter(&self, name: &str) {
            self.counters.lock().push(name.to_owned());
        }

        fn set_duration(&self, _name: &str, _elapsed: Duration) {}
    }

    fn new_cache(
        backend: MockBackend,
        config: CacheConfig,
    ) -> HerdCache<String, MockBackend, IdentityHasher> {
        HerdCache::new(backend, IdentityHasher, config)
    }

    fn stale_config() -> CacheConfig {
        CacheConfig {
            use_stale_cache: true,
            stale_ttl_additional: Duration::from_secs(30),
            ..CacheConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_applies_compute_once() {
        let backend = MockBackend::new();
        let cache = new_cache(backend.clone(), CacheConfig::default());
        let computations = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(100));

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let cache = cache.clone();
                let computations = Arc::clone(&computations);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    cache
                        .apply("a", move || async move {
                            computations.fetch_add(1, Ordering::SeqCst);
                            sleep(Duration::from_millis(100)).await;
                            Ok(Some("V".to_owned()))
                        })
                        .await
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            let value = task.unwrap().unwrap().unwrap();
            assert_eq!(value.as_str(), "V");
        }

        // let the fire-and-forget write-back land
        sleep(Duration::from_millis(100)).await;
        assert_eq!(computations.load(Ordering::SeqCst), 1);
        assert_eq!(
            backend.sets(),
            vec![("a".to_owned(), 60, "V".to_owned())]
        );
    }

    #[tokio::test]
    async fn backend_hit_short_circuits_computation() {
        let backend = MockBackend::new();
        backend.put("a", "X");
        let cache = new_cache(backend.clone(), CacheConfig::default());
        let computations = Arc::new(AtomicUsize::new(0));

        let value = {
            let computations = Arc::clone(&computations);
            cache
                .apply("a", move || async move {
                    computations.fetch_add(1, Ordering::SeqCst);
                    Ok(Some("computed".to_owned()))
                })
                .await
                .unwrap()
        };

        assert_eq!(value.unwrap().as_str(), "X");
        assert_eq!(computations.load(Ordering::SeqCst), 0);
        assert!(backend.sets().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_entry_served_while_fresh_value_computes() {
        let backend = MockBackend::new();
        let metrics = Arc::new(RecordingMetrics::default());
        let cache = HerdCache::with_metrics(
            backend.clone(),
            IdentityHasher,
            stale_config(),
            metrics.clone(),
        );

        let first = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .apply("a", || async {
                        sleep(Duration::from_millis(300)).await;
                        Ok(Some("F".to_owned()))
                    })
                    .await
            })
        };

        // let the first caller claim the slot and start computing
        sleep(Duration::from_millis(100)).await;
        backend.put("stalea", "S");

        let second = cache
            .apply("a", || async { Ok(Some("X".to_owned())) })
            .await
            .unwrap();
        assert_eq!(second.unwrap().as_str(), "S");

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.unwrap().as_str(), "F");

        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            backend.sets(),
            vec![
                ("stalea".to_owned(), 90, "F".to_owned()),
                ("a".to_owned(), 60, "F".to_owned()),
            ]
        );
        assert!(
            metrics
                .hits
                .lock()
                .iter()
                .any(|cache_type| cache_type == CACHE_TYPE_STALE_CACHE)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_miss_falls_back_to_fresh_result() {
        let backend = MockBackend::new();
        let cache = new_cache(backend.clone(), stale_config());

        let first = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .apply("a", || async {
                        sleep(Duration::from_millis(200)).await;
                        Ok(Some("F".to_owned()))
                    })
                    .await
            })
        };

        sleep(Duration::from_millis(50)).await;
        let second = cache
            .apply("a", || async { Ok(Some("X".to_owned())) })
            .await
            .unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(second.unwrap().as_str(), "F");
        assert_eq!(first.unwrap().as_str(), "F");
    }

    #[tokio::test]
    async fn computation_failure_fans_out_and_releases_the_slot() {
        let backend = MockBackend::new();
        let cache = new_cache(backend.clone(), CacheConfig::default());

        let result = cache
            .apply("a", || async {
                Err::<Option<String>, ComputationError>("boom".into())
            })
            .await;
        match result {
            Err(CacheError::Computation(message)) => assert!(message.contains("boom")),
            other => panic!("expected computation error, got {other:?}"),
        }
        assert!(backend.sets().is_empty());

        // the slot was released; a new computation runs
        let value = cache
            .apply("a", || async { Ok(Some("recovered".to_owned())) })
            .await
            .unwrap();
        assert_eq!(value.unwrap().as_str(), "recovered");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unavailable_backend_coalesces_locally() {
        let backend = MockBackend::new();
        backend.state.available.store(false, Ordering::SeqCst);
        let cache = new_cache(backend.clone(), CacheConfig::default());
        let computations = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(50));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let cache = cache.clone();
                let computations = Arc::clone(&computations);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    cache
                        .apply("a", move || async move {
                            computations.fetch_add(1, Ordering::SeqCst);
                            sleep(Duration::from_millis(100)).await;
                            Ok(Some("V".to_owned()))
                        })
                        .await
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            let value = task.unwrap().unwrap().unwrap();
            assert_eq!(value.as_str(), "V");
        }

        sleep(Duration::from_millis(50)).await;
        assert_eq!(computations.load(Ordering::SeqCst), 1);
        assert_eq!(backend.state.gets.load(Ordering::SeqCst), 0);
        assert!(backend.sets().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_flight_table_stays_bounded_under_churn() {
        let backend = MockBackend::new();
        let config = CacheConfig {
            max_capacity: 8,
            ..CacheConfig::default()
        };
        let cache = new_cache(backend.clone(), config);

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let key = format!("key{i}");
                    let value = format!("value{i}");
                    cache
                        .apply(&key, move || async move {
                            sleep(Duration::from_millis(100)).await;
                            Ok(Some(value))
                        })
                        .await
                })
            })
            .collect();

        sleep(Duration::from_millis(30)).await;
        assert!(cache.core.fresh.len() <= 8);

        for (i, task) in futures::future::join_all(tasks).await.into_iter().enumerate() {
            let value = task.unwrap().unwrap().unwrap();
            assert_eq!(value.as_str(), format!("value{i}"));
        }
    }

    #[tokio::test]
    async fn empty_computed_value_resolves_without_backend_write() {
        let backend = MockBackend::new();
        let cache = new_cache(backend.clone(), CacheConfig::default());

        let value = cache
            .apply("a", || async { Ok(None::<String>) })
            .await
            .unwrap();
        assert!(value.is_none());

        sleep(Duration::from_millis(50)).await;
        assert!(backend.sets().is_empty());
    }

    #[tokio::test]
    async fn uncacheable_value_resolves_without_backend_write() {
        let backend = MockBackend::new();
        let cache = new_cache(backend.clone(), CacheConfig::default());

        let value = cache
            .apply_filtered(
                "a",
                || async { Ok(Some("V".to_owned())) },
                Duration::from_secs(60),
                |_| false,
            )
            .await
            .unwrap();
        assert_eq!(value.unwrap().as_str(), "V");

        sleep(Duration::from_millis(50)).await;
        assert!(backend.sets().is_empty());
    }

    #[tokio::test]
    async fn backend_get_error_is_a_miss() {
        let backend = MockBackend::new();
        backend.state.fail_gets.store(true, Ordering::SeqCst);
        let cache = new_cache(backend.clone(), CacheConfig::default());

        let value = cache
            .apply("a", || async { Ok(Some("V".to_owned())) })
            .await
            .unwrap();
        assert_eq!(value.unwrap().as_str(), "V");
    }

    #[tokio::test]
    async fn slow_backend_set_still_publishes_the_value() {
        let backend = MockBackend::new();
        *backend.state.set_delay.lock() = Duration::from_millis(200);
        let config = CacheConfig {
            wait_for_backend_set: true,
            set_wait_duration: Duration::from_millis(50),
            ..CacheConfig::default()
        };
        let cache = new_cache(backend.clone(), config);

        let value = cache
            .apply("a", || async { Ok(Some("V".to_owned())) })
            .await
            .unwrap();
        assert_eq!(value.unwrap().as_str(), "V");
    }

    #[tokio::test]
    async fn clear_key_deletes_stale_namespace_first() {
        let backend = MockBackend::new();
        let cache = new_cache(backend.clone(), stale_config());

        cache.clear_key("a").await.unwrap();

        assert_eq!(
            backend.state.deletes.lock().clone(),
            vec!["stalea".to_owned(), "a".to_owned()]
        );
    }

    #[tokio::test]
    async fn clear_key_without_stale_tier_deletes_only_the_fresh_key() {
        let backend = MockBackend::new();
        let cache = new_cache(backend.clone(), CacheConfig::default());

        cache.clear_key("a").await.unwrap();

        assert_eq!(backend.state.deletes.lock().clone(), vec!["a".to_owned()]);
    }

    #[tokio::test]
    async fn clear_flushes_the_backend() {
        let backend = MockBackend::new();
        let cache = new_cache(backend.clone(), CacheConfig::default());

        cache.clear(true).await.unwrap();

        assert_eq!(backend.state.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_reads_through_without_scheduling_work() {
        let backend = MockBackend::new();
        backend.put("a", "X");
        let cache = new_cache(backend.clone(), CacheConfig::default());

        let hit = cache.get("a").await.unwrap();
        assert_eq!(hit.unwrap().as_str(), "X");

        let miss = cache.get("b").await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_joins_an_in_flight_computation() {
        let backend = MockBackend::new();
        let cache = new_cache(backend.clone(), CacheConfig::default());
        let computations = Arc::new(AtomicUsize::new(0));

        let first = {
            let cache = cache.clone();
            let computations = Arc::clone(&computations);
            tokio::spawn(async move {
                cache
                    .apply("a", move || async move {
                        computations.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(200)).await;
                        Ok(Some("V".to_owned()))
                    })
                    .await
            })
        };

        sleep(Duration::from_millis(50)).await;
        let joined = cache.get("a").await.unwrap();
        assert_eq!(joined.unwrap().as_str(), "V");

        first.await.unwrap().unwrap();
        assert_eq!(computations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_rejects_later_calls() {
        let backend = MockBackend::new();
        let cache = new_cache(backend.clone(), CacheConfig::default());

        cache.shutdown();
        cache.shutdown();
        assert_eq!(backend.state.shutdowns.load(Ordering::SeqCst), 1);

        let result = cache
            .apply("a", || async { Ok(Some("V".to_owned())) })
            .await;
        assert!(matches!(result, Err(CacheError::Shutdown)));
        assert!(matches!(cache.get("a").await, Err(CacheError::Shutdown)));
        assert!(matches!(cache.clear_key("a").await, Err(CacheError::Shutdown)));
        assert!(matches!(cache.clear(false).await, Err(CacheError::Shutdown)));
    }
}
