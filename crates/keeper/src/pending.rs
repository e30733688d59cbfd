use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};

use bytes::Bytes;
use keeper_types::{Key, ValueMeta};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlushState {
    Queued,
    Flushing,
}

struct PendingEntry {
    meta: ValueMeta,
    meta_bytes: Bytes,
    data: Bytes,
    state: FlushState,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<Key, PendingEntry>,
    failures: HashMap<Key, String>,
}

/// What [`PendingRegistry::withdraw`] found for a key.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Withdrawal {
    /// The flush had not started and will not run.
    Cancelled,
    /// The flush was running; it has finished, successfully or not.
    Settled,
    /// Nothing was pending under the key.
    Absent,
}

/// Values written by buffered streams whose background flush has not
/// finished yet.
///
/// An entry is created when a buffered stream closes and is removed exactly
/// once: by its flush job when persistence completes, or by a delete that
/// cancels it before the job starts.
#[derive(Default)]
pub(crate) struct PendingRegistry {
    inner: Mutex<Registry>,
    settled: Condvar,
}

impl PendingRegistry {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().expect("pending registry poisoned")
    }

    /// Register a value. Returns `false` if the key is already pending.
    pub fn insert(&self, key: Key, meta: ValueMeta, meta_bytes: Bytes, data: Bytes) -> bool {
        let mut registry = self.lock();
        if registry.entries.contains_key(&key) {
            return false;
        }
        registry.failures.remove(&key);
        registry.entries.insert(
            key,
            PendingEntry {
                meta,
                meta_bytes,
                data,
                state: FlushState::Queued,
            },
        );
        true
    }

    /// Drop an entry whose flush could not be scheduled.
    pub fn forget(&self, key: &Key) {
        self.lock().entries.remove(key);
        self.settled.notify_all();
    }

    pub fn get(&self, key: &Key) -> Option<(ValueMeta, Bytes)> {
        self.lock()
            .entries
            .get(key)
            .map(|e| (e.meta.clone(), e.data.clone()))
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<Key> {
        self.lock().entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Mark the entry as flushing and hand out what must be persisted.
    /// `None` if a delete cancelled it first.
    pub fn begin_flush(&self, key: &Key) -> Option<(Bytes, Bytes)> {
        let mut registry = self.lock();
        let entry = registry.entries.get_mut(key)?;
        entry.state = FlushState::Flushing;
        Some((entry.meta_bytes.clone(), entry.data.clone()))
    }

    /// Remove the entry after its flush, recording a failure if there was one.
    pub fn finish_flush(&self, key: &Key, outcome: Result<(), String>) {
        let mut registry = self.lock();
        registry.entries.remove(key);
        if let Err(reason) = outcome {
            registry.failures.insert(*key, reason);
        }
        drop(registry);
        self.settled.notify_all();
    }

    /// Take a key out of the registry on behalf of a delete.
    ///
    /// A queued entry is cancelled; a flushing one is waited for.
    pub fn withdraw(&self, key: &Key) -> Withdrawal {
        let mut registry = self.lock();
        match registry.entries.get(key).map(|e| e.state) {
            None => Withdrawal::Absent,
            Some(FlushState::Queued) => {
                registry.entries.remove(key);
                Withdrawal::Cancelled
            }
            Some(FlushState::Flushing) => {
                while registry.entries.contains_key(key) {
                    registry = self
                        .settled
                        .wait(registry)
                        .expect("pending registry poisoned");
                }
                Withdrawal::Settled
            }
        }
    }

    pub fn failures(&self) -> HashMap<Key, String> {
        self.lock().failures.clone()
    }
}
