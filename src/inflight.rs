//! Generic single-flight tracking keyed by a 32-byte id (spec §9 design
//! note: "a typed concurrent set keyed by the 32-byte id; acquisition
//! returns a handle whose destruction releases the slot"). Used by the
//! fulfillment router (per request id) and the keep-alive driver (per
//! subscription id) — spec invariants P1/L3 and the subscription
//! equivalent both rest on this.
//!
//! Generalizes the teacher's `KeeperState::in_flight` map (keyed to one
//! collect-tx lifecycle) into a reusable acquire/release guard so every
//! caller gets the scoped-release discipline for free instead of having
//! to remember to clear the entry on every exit path.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

pub struct InFlightSet<K> {
    inner: Arc<Mutex<HashSet<K>>>,
}

impl<K> Clone for InFlightSet<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for InFlightSet<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

/// RAII guard: dropping it releases the slot, so every early-return path
/// in a handler still clears in-flight state (spec §4.6 step 5: "Always
/// clear in-flight in a guaranteed-release scope").
pub struct InFlightGuard<K>
where
    K: Eq + Hash + Clone,
{
    set: InFlightSet<K>,
    key: K,
}

impl<K> Drop for InFlightGuard<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        self.set.inner.lock().unwrap().remove(&self.key);
    }
}

impl<K> InFlightSet<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().unwrap().contains(key)
    }

    /// Attempts to acquire the slot for `key`. Returns `None` if another
    /// task already holds it (spec: "if the id is already in the
    /// in-flight set, drop").
    pub fn try_acquire(&self, key: K) -> Option<InFlightGuard<K>> {
        let mut guard = self.inner.lock().unwrap();
        if !guard.insert(key.clone()) {
            return None;
        }
        drop(guard);
        Some(InFlightGuard {
            set: self.clone(),
            key,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_for_same_key_fails_while_first_holds_it() {
        let set: InFlightSet<u64> = InFlightSet::new();
        let first = set.try_acquire(1).expect("first acquire succeeds");
        assert!(set.try_acquire(1).is_none());
        drop(first);
        assert!(set.try_acquire(1).is_some());
    }

    #[test]
    fn dropping_guard_releases_the_slot() {
        let set: InFlightSet<u64> = InFlightSet::new();
        {
            let _guard = set.try_acquire(42).unwrap();
            assert!(set.contains(&42));
        }
        assert!(!set.contains(&42));
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let set: InFlightSet<u64> = InFlightSet::new();
        let _a = set.try_acquire(1).unwrap();
        let _b = set.try_acquire(2).unwrap();
        assert_eq!(set.len(), 2);
    }
}
