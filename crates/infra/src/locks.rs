//! Keyed critical sections.
//!
//! One mutex per key, created on first use and dropped again once nobody holds
//! or waits for it. Work under different keys never contends; work under the
//! same key runs one at a time. The engine keys allocation/ledger/finalization
//! work by supplier and delivery work by supplier-order line.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug)]
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &K) -> Arc<Mutex<()>> {
        // Every map update is a single insert or remove; a poisoned guard leaves it consistent.
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.clone()).or_default().clone()
    }

    /// Drop the map entry for `key` when `slot` is its last outside holder.
    ///
    /// Clones are only taken under the map lock, so a count of two (the map and
    /// `slot`) cannot grow while that lock is held.
    fn release(&self, key: &K, slot: &Arc<Mutex<()>>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = slots
            .get(key)
            .is_some_and(|held| Arc::ptr_eq(held, slot) && Arc::strong_count(slot) == 2);
        if idle {
            slots.remove(key);
        }
    }

    /// Run `f` while holding the lock for `key`.
    pub fn run<T>(&self, key: &K, f: impl FnOnce() -> T) -> T {
        let slot = self.slot(key);
        let _release = Release {
            locks: self,
            key,
            slot: &slot,
        };
        let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs [`KeyedLocks::release`] on the way out of [`KeyedLocks::run`], unwinding included.
struct Release<'a, K>
where
    K: Eq + Hash + Clone,
{
    locks: &'a KeyedLocks<K>,
    key: &'a K,
    slot: &'a Arc<Mutex<()>>,
}

impl<K> Drop for Release<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.locks.release(self.key, self.slot);
    }
}
