//! Fixed-capacity LFU cache.
//!
//! Frequencies start at 1 and bump on every touch; when full, the entry
//! with the minimum frequency (ties broken by least recent touch) is
//! evicted and handed back to the caller, which may log a summary. The
//! cache never re-enters itself from eviction handling.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

struct Slot<V> {
    value: V,
    freq: u64,
    stamp: u64,
}

pub struct LfuCache<K, V> {
    capacity: usize,
    next_stamp: u64,
    slots: HashMap<K, Slot<V>>,
    // (freq, stamp, key) ordered ascending: first element is the eviction
    // candidate.
    order: BTreeSet<(u64, u64, K)>,
}

impl<K: Clone + Eq + Hash + Ord, V> LfuCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LFU capacity must be positive");
        LfuCache {
            capacity,
            next_stamp: 0,
            slots: HashMap::new(),
            order: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    /// Lookup with a frequency bump.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.touch(key)?;
        self.slots.get_mut(key).map(|slot| &mut slot.value)
    }

    /// Insert a new entry (frequency 1), evicting the minimum-frequency
    /// entry first when full. Returns the evicted pair, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.value = value;
            let key_clone = key.clone();
            self.touch(&key_clone);
            return None;
        }
        let evicted = if self.slots.len() >= self.capacity {
            self.evict_one()
        } else {
            None
        };
        let stamp = self.bump_stamp();
        self.order.insert((1, stamp, key.clone()));
        self.slots.insert(
            key,
            Slot {
                value,
                freq: 1,
                stamp,
            },
        );
        evicted
    }

    /// Get-or-insert primitive: returns any evicted pair plus a mutable
    /// handle to the (possibly fresh) entry.
    pub fn get_or_insert_with(
        &mut self,
        key: K,
        make: impl FnOnce() -> V,
    ) -> (Option<(K, V)>, &mut V) {
        let evicted = if self.contains(&key) {
            self.touch(&key);
            None
        } else {
            self.insert(key.clone(), make())
        };
        let value = self
            .slots
            .get_mut(&key)
            .map(|slot| &mut slot.value)
            .expect("entry just inserted or touched");
        (evicted, value)
    }

    /// Snapshot iteration without frequency bumps.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().map(|(k, slot)| (k, &slot.value))
    }

    /// Access frequency of an entry, for inspection in summaries.
    pub fn frequency(&self, key: &K) -> Option<u64> {
        self.slots.get(key).map(|slot| slot.freq)
    }

    fn touch(&mut self, key: &K) -> Option<()> {
        let stamp = self.bump_stamp();
        let slot = self.slots.get_mut(key)?;
        self.order.remove(&(slot.freq, slot.stamp, key.clone()));
        slot.freq += 1;
        slot.stamp = stamp;
        self.order.insert((slot.freq, slot.stamp, key.clone()));
        Some(())
    }

    fn evict_one(&mut self) -> Option<(K, V)> {
        let (freq, stamp, key) = self.order.iter().next()?.clone();
        self.order.remove(&(freq, stamp, key.clone()));
        let slot = self.slots.remove(&key)?;
        Some((key, slot.value))
    }

    fn bump_stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_picks_minimum_frequency() {
        let mut cache = LfuCache::new(2);
        assert!(cache.insert("a".to_owned(), 1).is_none());
        assert!(cache.insert("b".to_owned(), 2).is_none());
        // Touch "a" so "b" is the LFU candidate.
        cache.get_mut(&"a".to_owned());
        let evicted = cache.insert("c".to_owned(), 3).unwrap();
        assert_eq!(evicted.0, "b");
        assert!(cache.contains(&"a".to_owned()));
        assert!(cache.contains(&"c".to_owned()));
    }

    #[test]
    fn full_cache_evicts_exactly_one_minimum_entry() {
        let mut cache = LfuCache::new(3);
        for (k, touches) in [("x", 5), ("y", 1), ("z", 3)] {
            cache.insert(k.to_owned(), 0);
            for _ in 0..touches {
                cache.get_mut(&k.to_owned());
            }
        }
        let min_key = ["x", "y", "z"]
            .into_iter()
            .min_by_key(|k| cache.frequency(&(*k).to_owned()).unwrap())
            .unwrap();
        let evicted = cache.insert("w".to_owned(), 0).unwrap();
        assert_eq!(evicted.0, min_key);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn frequency_ties_evict_least_recently_touched() {
        let mut cache = LfuCache::new(2);
        cache.insert("old".to_owned(), 1);
        cache.insert("new".to_owned(), 2);
        let evicted = cache.insert("third".to_owned(), 3).unwrap();
        assert_eq!(evicted.0, "old");
    }

    #[test]
    fn get_or_insert_bumps_existing() {
        let mut cache: LfuCache<String, u32> = LfuCache::new(2);
        let (evicted, value) = cache.get_or_insert_with("k".to_owned(), || 7);
        assert!(evicted.is_none());
        assert_eq!(*value, 7);
        *value = 9;
        let (evicted, value) = cache.get_or_insert_with("k".to_owned(), || 0);
        assert!(evicted.is_none());
        assert_eq!(*value, 9);
        assert_eq!(cache.frequency(&"k".to_owned()), Some(2));
    }

    #[test]
    fn reinsert_updates_value_without_eviction() {
        let mut cache = LfuCache::new(1);
        cache.insert("k".to_owned(), 1);
        assert!(cache.insert("k".to_owned(), 2).is_none());
        assert_eq!(cache.get_mut(&"k".to_owned()), Some(&mut 2));
    }
}
