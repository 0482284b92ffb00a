//! Deadline-ordered slot map.
//!
//! A [`DelayQueue`] files values under an absolute deadline (milliseconds since
//! the epoch) and hands back every slot whose deadline has passed. The
//! conflation service uses it for flush windows and the ingestion handler for
//! pending agent resets.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Ordered map of deadline to shared slot.
pub struct DelayQueue<V> {
    slots: RwLock<BTreeMap<u64, Arc<V>>>,
}

impl<V> DelayQueue<V> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the slot for `deadline`, creating it with `init` if absent.
    ///
    /// Lookups only take the read lock; creation takes the write lock and
    /// re-checks, so a slot is constructed at most once.
    pub fn get_or_insert_with<F>(&self, deadline: u64, init: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        if let Some(slot) = self.slots.read().get(&deadline) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(deadline).or_insert_with(|| Arc::new(init())))
    }

    /// Returns the slot for `deadline`, if present.
    pub fn get(&self, deadline: u64) -> Option<Arc<V>> {
        self.slots.read().get(&deadline).cloned()
    }

    /// Removes and returns all slots with a deadline at or before `now`,
    /// earliest first.
    pub fn drain_expired(&self, now: u64) -> Vec<(u64, Arc<V>)> {
        match self.next_deadline() {
            Some(first) if first <= now => {},
            _ => return Vec::new(),
        }
        let mut slots = self.slots.write();
        let expired = match now.checked_add(1) {
            Some(bound) => {
                let pending = slots.split_off(&bound);
                std::mem::replace(&mut *slots, pending)
            },
            None => std::mem::take(&mut *slots),
        };
        expired.into_iter().collect()
    }

    /// Earliest deadline currently held.
    pub fn next_deadline(&self) -> Option<u64> {
        self.slots.read().keys().next().copied()
    }

    /// Number of open slots.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Drops every slot.
    pub fn clear(&self) {
        self.slots.write().clear();
    }
}

impl<V> Default for DelayQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}
