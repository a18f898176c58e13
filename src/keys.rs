//! Key canonicalization
//!
//! User keys are mapped to the canonical backend key string through a
//! pluggable [`KeyHasher`] plus an optional configured prefix. Stale-tier
//! entries live under the same canonical key with a namespace prefix in
//! front.

use std::hash::Hasher as _;

/// Pure user-key to backend-key string mapping.
///
/// Implementations must be deterministic: the same input always yields the
/// same output.
pub trait KeyHasher: Send + Sync + 'static {
    fn hash(&self, key: &str) -> String;
}

/// Passes keys through untouched.
///
/// Suitable when user keys are already short, ASCII-safe backend keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityHasher;

impl KeyHasher for IdentityHasher {
    fn hash(&self, key: &str) -> String {
        key.to_owned()
    }
}

/// Fast non-cryptographic hasher producing a fixed-width hex key.
#[derive(Debug, Clone, Copy, Default)]
pub struct AHashKeyHasher;

impl KeyHasher for AHashKeyHasher {
    fn hash(&self, key: &str) -> String {
        // Default AHasher keys are fixed, so the digest is stable across
        // processes.
        let mut hasher = ahash::AHasher::default();
        hasher.write(key.as_bytes());
        format!("{:016x}", hasher.finish())
    }
}

/// Applies the configured prefix policy and stale namespace on top of a
/// [`KeyHasher`].
pub(crate) struct KeyBuilder<H> {
    hasher: H,
    prefix: Option<String>,
    hash_prefix: bool,
    stale_prefix: String,
}

impl<H: KeyHasher> KeyBuilder<H> {
    pub(crate) fn new(
        hasher: H,
        prefix: Option<String>,
        hash_prefix: bool,
        stale_prefix: String,
    ) -> Self {
        Self {
            hasher,
            prefix,
            hash_prefix,
            stale_prefix,
        }
    }

    /// Canonical backend key for a user key.
    pub(crate) fn canonical(&self, user_key: &str) -> String {
        match &self.prefix {
            Some(prefix) if self.hash_prefix => self.hasher.hash(&format!("{prefix}{user_key}")),
            Some(prefix) => format!("{prefix}{}", self.hasher.hash(user_key)),
            None => self.hasher.hash(user_key),
        }
    }

    /// Stale-namespace key for an already-canonical key.
    pub(crate) fn stale(&self, canonical_key: &str) -> String {
        format!("{}{canonical_key}", self.stale_prefix)
    }
}
