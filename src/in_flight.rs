//! In-flight computation tracking
//!
//! Every value computation is represented by a single-assignment pending
//! value: the owning writer holds the sender side, any number of coalesced
//! waiters hold cloned observers. A bounded keyed table maps canonical keys
//! to the pending value of the computation currently in flight for them,
//! with an atomic claim-or-join primitive.
//!
//! The table only deduplicates concurrent callers; it is not a value cache.
//! Entries live for the duration of one computation and are removed by their
//! owning writer on resolution or failure. Waiters never remove entries, and
//! an entry evicted by the capacity bound stays valid for everyone already
//! holding an observer.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::CacheError;

/// Terminal outcome of a computation, fanned out to every observer.
///
/// Computation failures travel as their rendered message so that a single
/// failure can be delivered to any number of waiters.
pub(crate) type Outcome<V> = Result<Option<Arc<V>>, String>;

type Slot<V> = Option<Outcome<V>>;

/// Observer side of a pending computation. Cheap to clone.
pub(crate) struct PendingValue<V> {
    rx: watch::Receiver<Slot<V>>,
}

impl<V> Clone for PendingValue<V> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<V> PendingValue<V> {
    /// Wait for the terminal outcome.
    ///
    /// Every observer of the same pending value receives the same outcome.
    /// A writer that disappears without publishing yields
    /// [`CacheError::Cancelled`].
    pub(crate) async fn wait(&self) -> Result<Option<Arc<V>>, CacheError> {
        let mut rx = self.rx.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if let Some(outcome) = current.as_ref() {
                    return Self::unpack(outcome);
                }
            }
            if rx.changed().await.is_err() {
                // Sender gone; it may still have published first.
                let current = rx.borrow();
                return match current.as_ref() {
                    Some(outcome) => Self::unpack(outcome),
                    None => Err(CacheError::Cancelled),
                };
            }
        }
    }

    fn unpack(outcome: &Outcome<V>) -> Result<Option<Arc<V>>, CacheError> {
        match outcome {
            Ok(value) => Ok(value.clone()),
            Err(message) => Err(CacheError::Computation(message.clone())),
        }
    }
}

struct Entry<V> {
    generation: u64,
    value: PendingValue<V>,
}

/// Result of [`InFlightTable::claim`].
pub(crate) enum Claim<V> {
    /// The slot was empty; the caller now owns the computation.
    Owner(InFlightGuard<V>),
    /// Another caller owns the computation for this key.
    Joined(PendingValue<V>),
}

struct TableInner<V> {
    entries: Mutex<LruCache<String, Entry<V>>>,
    generations: AtomicU64,
    remove_before_publish: bool,
}

impl<V> TableInner<V> {
    fn unclaim(&self, key: &str, generation: u64) {
        let mut entries = self.entries.lock();
        // An evicted-and-reclaimed key belongs to a newer writer now.
        if entries.peek(key).map(|entry| entry.generation) == Some(generation) {
            entries.pop(key);
        }
    }
}

/// Bounded key to pending-value table.
///
/// Exceeding the capacity evicts the least-recently-accessed entry. The
/// publish/unclaim ordering of completing writers is fixed at construction.
/// Clones share the same state.
pub(crate) struct InFlightTable<V> {
    inner: Arc<TableInner<V>>,
}

impl<V> Clone for InFlightTable<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> InFlightTable<V> {
    pub(crate) fn new(capacity: usize, remove_before_publish: bool) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(TableInner {
                entries: Mutex::new(LruCache::new(capacity)),
                generations: AtomicU64::new(0),
                remove_before_publish,
            }),
        }
    }

    /// Atomically claim the slot for `key`, or join the existing owner.
    pub(crate) fn claim(&self, key: &str) -> Claim<V> {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get(key) {
            return Claim::Joined(entry.value.clone());
        }
        let (tx, rx) = watch::channel(None);
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        entries.push(
            key.to_owned(),
            Entry {
                generation,
                value: PendingValue { rx },
            },
        );
        Claim::Owner(InFlightGuard {
            key: key.to_owned(),
            generation,
            table: Arc::clone(&self.inner),
            tx: Some(tx),
            #[cfg(test)]
            mid_complete: None,
        })
    }

    /// Observer for the computation currently in flight for `key`, if any.
    pub(crate) fn get(&self, key: &str) -> Option<PendingValue<V>> {
        self.inner
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.value.clone())
    }

    pub(crate) fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }
}

/// Owning writer side of a pending computation.
///
/// Completing publishes the outcome to every observer and vacates the table
/// slot, in the order the table was configured with. Dropping the guard
/// without completing vacates the slot and leaves observers with
/// [`CacheError::Cancelled`].
pub(crate) struct InFlightGuard<V> {
    key: String,
    generation: u64,
    table: Arc<TableInner<V>>,
    tx: Option<watch::Sender<Slot<V>>>,
    #[cfg(test)]
    pub(crate) mid_complete: Option<Box<dyn Fn() + Send>>,
}

impl<V> InFlightGuard<V> {
    /// Observer handle for this computation.
    pub(crate) fn observer(&self) -> PendingValue<V> {
        PendingValue {
            rx: self
                .tx
                .as_ref()
                .expect("guard not yet completed")
                .subscribe(),
        }
    }

    /// Publish the outcome and vacate the slot.
    pub(crate) fn complete(mut self, outcome: Outcome<V>) {
        let tx = self.tx.take().expect("guard completed twice");
        if self.table.remove_before_publish {
            self.table.unclaim(&self.key, self.generation);
            self.barrier();
            let _ = tx.send(Some(outcome));
        } else {
            let _ = tx.send(Some(outcome));
            self.barrier();
            self.table.unclaim(&self.key, self.generation);
        }
    }

    #[cfg(test)]
    fn barrier(&self) {
        if let Some(hook) = &self.mid_complete {
            hook();
        }
    }

    #[cfg(not(test))]
    fn barrier(&self) {}
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.table.unclaim(&self.key, self.generation);
        }
    }
}
