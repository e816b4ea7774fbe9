//! Key cache and slot allocator.
//!
//! One [`KeyCacheEntry`] per session slot records which key identities the
//! slot serves. Allocation reuses a slot whose entry shares a key identity
//! with the request and otherwise evicts the oldest non-primary slot. A slot
//! marked primary is never evicted.
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::{KeyIdentity, SlotIndex};

/// Bookkeeping for one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCacheEntry {
    /// Key identities served by the slot; empty if the slot was never used.
    pub key_ids: Vec<KeyIdentity>,
    /// Allocation sequence number; larger is newer.
    pub created_at: u64,
    pub is_failed: bool,
    pub is_primary: bool,
}

impl KeyCacheEntry {
    pub fn matches(&self, key_ids: &[KeyIdentity]) -> bool {
        self.key_ids.iter().any(|k| key_ids.contains(k))
    }

    fn contains(&self, key_id: &KeyIdentity) -> bool {
        self.key_ids.contains(key_id)
    }
}

/// Outcome of [`KeyCache::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// The slot already serves one of the requested key identities.
    Hit(SlotIndex),
    /// The slot was (re)assigned to the requested key identities.
    Miss(SlotIndex),
}

impl Allocation {
    pub fn slot(self) -> SlotIndex {
        match self {
            Allocation::Hit(slot) | Allocation::Miss(slot) => slot,
        }
    }

    pub fn is_reusable(self) -> bool {
        matches!(self, Allocation::Hit(_))
    }
}

/// Fixed-size table of key cache entries, one per slot.
#[derive(Debug, Clone)]
pub struct KeyCache {
    entries: Vec<KeyCacheEntry>,
    clock: u64,
}

impl KeyCache {
    /// Create a cache with `max_sessions` never-used entries.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: vec![KeyCacheEntry::default(); max_sessions],
            clock: 0,
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry of `slot`, or `None` if `slot` is out of range.
    pub fn entry(&self, slot: SlotIndex) -> Option<&KeyCacheEntry> {
        self.entries.get(slot)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Find the slot whose entry shares a key identity with `key_ids`.
    pub fn find(&self, key_ids: &[KeyIdentity]) -> Option<SlotIndex> {
        self.entries.iter().position(|e| e.matches(key_ids))
    }

    /// Allocate a slot for `key_ids`.
    ///
    /// A hit refreshes the entry's `created_at` and sets the primary flag when
    /// `is_primary` is requested. A hit on a failed entry is an error. On a miss
    /// the oldest non-primary slot is overwritten.
    pub fn allocate(&mut self, key_ids: &[KeyIdentity], is_primary: bool) -> Result<Allocation> {
        if let Some(slot) = self.find(key_ids) {
            let now = self.tick();
            let entry = &mut self.entries[slot];
            if entry.is_failed {
                let key_id = key_ids.first().map(ToString::to_string).unwrap_or_default();
                warn!("Key id {} already failed at slot {}", key_id, slot);
                return Err(Error::KeyPreviouslyFailed { key_id, slot });
            }
            entry.created_at = now;
            entry.is_primary |= is_primary;
            debug!("Key cache hit at slot {} (primary: {})", slot, entry.is_primary);
            return Ok(Allocation::Hit(slot));
        }

        let victim = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_primary)
            .min_by_key(|(_, e)| e.created_at)
            .map(|(slot, _)| slot)
            .ok_or_else(|| {
                warn!("All {} session slots are primary", self.entries.len());
                Error::NoCapacity {
                    max: self.entries.len(),
                }
            })?;

        let now = self.tick();
        self.entries[victim] = KeyCacheEntry {
            key_ids: key_ids.to_vec(),
            created_at: now,
            is_failed: false,
            is_primary,
        };
        info!("Selected slot {} for new key id(s)", victim);
        Ok(Allocation::Miss(victim))
    }

    /// Mark the entry at `slot` failed (or clear the mark).
    pub fn set_failed(&mut self, slot: SlotIndex, failed: bool) {
        if let Some(entry) = self.entries.get_mut(slot) {
            entry.is_failed = failed;
        }
    }

    /// Mark the entry at `slot` failed if it still serves `key_ids`.
    ///
    /// The slot may have been handed to other key identities while the
    /// failing acquisition ran; that entry is left alone. Returns whether
    /// the mark was set.
    pub fn set_failed_for(&mut self, slot: SlotIndex, key_ids: &[KeyIdentity]) -> bool {
        match self.entries.get_mut(slot) {
            Some(entry) if entry.matches(key_ids) => {
                entry.is_failed = true;
                true
            }
            _ => false,
        }
    }

    /// Whether `key_id` was processed, and if so whether it succeeded.
    pub fn is_key_id_processed(&self, key_id: &KeyIdentity) -> Option<bool> {
        self.entries
            .iter()
            .find(|e| e.contains(key_id))
            .map(|e| !e.is_failed)
    }

    /// Drop the primary flag of the slot serving `key_id`.
    pub fn release_primary(&mut self, key_id: &KeyIdentity) -> Option<SlotIndex> {
        let slot = self.entries.iter().position(|e| e.contains(key_id))?;
        self.entries[slot].is_primary = false;
        Some(slot)
    }

    /// Forget failed entries and release every primary flag.
    ///
    /// Returns the slots whose entries were cleared.
    pub fn clear_failed(&mut self) -> Vec<SlotIndex> {
        let mut cleared = Vec::new();
        for (slot, entry) in self.entries.iter_mut().enumerate() {
            if entry.is_failed {
                entry.key_ids.clear();
                entry.is_failed = false;
                entry.created_at = 0;
                cleared.push(slot);
            }
            entry.is_primary = false;
        }
        cleared
    }

    /// Reset the entry at `slot` to the never-used state.
    pub fn reset(&mut self, slot: SlotIndex) {
        if let Some(entry) = self.entries.get_mut(slot) {
            *entry = KeyCacheEntry::default();
        }
    }

    /// Reset every entry.
    pub fn clear(&mut self) {
        self.entries.fill(KeyCacheEntry::default());
    }
}

#[cfg(test)]
mod tests {
    use super::{Allocation, KeyCache};
    use crate::error::Error;
    use crate::session::KeyIdentity;

    fn key(b: u8) -> Vec<KeyIdentity> {
        vec![KeyIdentity::new(vec![b; 16])]
    }

    #[test]
    fn hit_returns_same_slot() {
        let mut cache = KeyCache::new(2);
        let first = cache.allocate(&key(1), false).expect("allocate");
        assert!(!first.is_reusable());
        let again = cache.allocate(&key(1), false).expect("allocate");
        assert_eq!(again, Allocation::Hit(first.slot()));
    }

    #[test]
    fn any_shared_key_id_is_a_hit() {
        let mut cache = KeyCache::new(2);
        let ids = vec![KeyIdentity::new(vec![1]), KeyIdentity::new(vec![2])];
        let slot = cache.allocate(&ids, false).expect("allocate").slot();
        let hit = cache
            .allocate(&[KeyIdentity::new(vec![2])], false)
            .expect("allocate");
        assert_eq!(hit, Allocation::Hit(slot));
    }

    #[test]
    fn oldest_non_primary_slot_is_evicted() {
        let mut cache = KeyCache::new(3);
        let a = cache.allocate(&key(1), false).expect("a").slot();
        let b = cache.allocate(&key(2), false).expect("b").slot();
        let c = cache.allocate(&key(3), false).expect("c").slot();
        assert_eq!((a, b, c), (0, 1, 2));

        // Touch `a` so `b` becomes the oldest.
        cache.allocate(&key(1), false).expect("hit");
        let d = cache.allocate(&key(4), false).expect("d");
        assert_eq!(d, Allocation::Miss(b));
        assert_eq!(cache.find(&key(2)), None);
    }

    #[test]
    fn all_primary_slots_exhaust_capacity() {
        let mut cache = KeyCache::new(2);
        cache.allocate(&key(1), true).expect("a");
        cache.allocate(&key(2), true).expect("b");
        let err = cache.allocate(&key(3), false).expect_err("no capacity");
        assert!(matches!(err, Error::NoCapacity { max: 2 }));
        assert_eq!(cache.find(&key(3)), None);
    }

    #[test]
    fn eviction_only_among_released_slots() {
        let mut cache = KeyCache::new(3);
        for b in 1..=3 {
            cache.allocate(&key(b), true).expect("primary");
        }
        let released = cache
            .release_primary(&KeyIdentity::new(vec![3; 16]))
            .expect("release");
        for b in 10..15 {
            let slot = cache.allocate(&key(b), false).expect("allocate").slot();
            assert_eq!(slot, released);
        }
        assert!(cache.find(&key(1)).is_some());
        assert!(cache.find(&key(2)).is_some());
    }

    #[test]
    fn failed_key_is_rejected() {
        let mut cache = KeyCache::new(2);
        let slot = cache.allocate(&key(1), false).expect("allocate").slot();
        cache.set_failed(slot, true);
        assert_eq!(cache.is_key_id_processed(&key(1)[0]), Some(false));
        let err = cache.allocate(&key(1), false).expect_err("failed");
        assert!(matches!(err, Error::KeyPreviouslyFailed { slot: 0, .. }));
    }

    #[test]
    fn failure_mark_skips_rebound_slot() {
        let mut cache = KeyCache::new(1);
        let slot = cache.allocate(&key(1), false).expect("a").slot();
        assert_eq!(cache.allocate(&key(2), false).expect("b"), Allocation::Miss(slot));

        assert!(!cache.set_failed_for(slot, &key(1)));
        assert_eq!(cache.is_key_id_processed(&key(2)[0]), Some(true));
        assert!(cache.set_failed_for(slot, &key(2)));
        assert_eq!(cache.is_key_id_processed(&key(2)[0]), Some(false));
    }

    #[test]
    fn clear_failed_forgets_entries_and_primary_flags() {
        let mut cache = KeyCache::new(2);
        let failed = cache.allocate(&key(1), true).expect("a").slot();
        let ok = cache.allocate(&key(2), true).expect("b").slot();
        cache.set_failed(failed, true);

        assert_eq!(cache.clear_failed(), vec![failed]);
        assert_eq!(cache.is_key_id_processed(&key(1)[0]), None);
        assert_eq!(cache.is_key_id_processed(&key(2)[0]), Some(true));
        assert!(!cache.entry(ok).expect("entry").is_primary);
    }
}
