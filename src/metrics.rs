//! Metric sink interface
//!
//! The cache emits hit/miss counts, counters and durations to a consumer
//! provided [`MetricRecorder`]. Recording must be cheap and non-blocking;
//! the default recorder drops everything.

use std::time::Duration;

/// Sink for cache metrics.
///
/// Implementations must never block the caller.
pub trait MetricRecorder: Send + Sync + 'static {
    fn cache_hit(&self, cache_type: &str);
    fn cache_miss(&self, cache_type: &str);
    fn increment_counter(&self, name: &str);
    fn set_duration(&self, name: &str, elapsed: Duration);
}

/// Discards every metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricRecorder;

impl MetricRecorder for NoOpMetricRecorder {
    fn cache_hit(&self, _cache_type: &str) {}
    fn cache_miss(&self, _cache_type: &str) {}
    fn increment_counter(&self, _name: &str) {}
    fn set_duration(&self, _name: &str, _elapsed: Duration) {}
}
