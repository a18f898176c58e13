//! Cache error types

/// Cache-related errors
///
/// Backend faults never show up here: reads degrade to misses and writes are
/// best-effort, both logged only. The only failures surfaced to callers are
/// the ones originating from their own value computation, plus lifecycle
/// misuse.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The caller-supplied computation returned an error; every waiter
    /// coalesced onto the same computation receives the same message.
    #[error("value computation failed: {0}")]
    Computation(String),

    /// The owning computation went away without publishing a result.
    #[error("in-flight computation was cancelled")]
    Cancelled,

    /// The cache was already shut down.
    #[error("cache has been shut down")]
    Shutdown,
}
