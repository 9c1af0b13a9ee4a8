//! Bounded most-recently-used cache with watermark eviction.
//!
//! When an insert pushes the size above the high watermark, least recently
//! used entries are evicted until the size is back at the low watermark.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
pub struct MruCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    high_watermark: usize,
    low_watermark: usize,
    tick: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    last_used: u64,
}

impl<K: Hash + Eq + Clone, V: Clone> MruCache<K, V> {
    /// `low_watermark` is clamped to `high_watermark`.
    pub fn new(high_watermark: usize, low_watermark: usize) -> Self {
        let high_watermark = high_watermark.max(1);
        Self {
            entries: HashMap::with_capacity(high_watermark + 1),
            high_watermark,
            low_watermark: low_watermark.min(high_watermark),
            tick: 0,
        }
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.value.clone()
        })
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.tick += 1;
        self.entries.insert(
            key,
            Entry {
                value,
                last_used: self.tick,
            },
        );
        if self.entries.len() > self.high_watermark {
            self.evict_to_low_watermark();
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn evict_to_low_watermark(&mut self) {
        let excess = self.entries.len().saturating_sub(self.low_watermark);
        let mut by_age: Vec<(u64, K)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.last_used, key.clone()))
            .collect();
        by_age.sort_unstable_by_key(|(last_used, _)| *last_used);
        for (_, key) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
    }
}
