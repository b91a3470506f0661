//! Insertion-ordered LRU map used by the pool.
//!
//! Most-recently-used entries sit at the front. Lookups either renew an
//! entry (move it to the front) or leave its position untouched, so
//! bookkeeping reads don't distort the eviction order. Trimming walks
//! from the oldest entry and lets the caller decide per entry whether to
//! evict, leave, or stop the walk.

use std::collections::VecDeque;

/// Per-entry decision during a trim walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropAction {
    /// Remove the entry.
    Evict,
    /// Keep the entry and continue walking.
    Leave,
    /// Keep the entry and stop the walk.
    Stop,
}

/// LRU map with renew/leave lookups.
pub struct LruMap<K: PartialEq, V> {
    entries: VecDeque<(K, V)>,
    max_size: usize,
}

impl<K: PartialEq, V> LruMap<K, V> {
    /// Create a map with the given soft size limit.
    pub fn new(max_size: usize) -> Self {
        LruMap {
            entries: VecDeque::new(),
            max_size,
        }
    }

    /// Soft size limit; exceeding it signals eviction pressure.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the map exceeds its soft limit.
    pub fn oversized(&self) -> bool {
        self.entries.len() > self.max_size
    }

    /// Look up without disturbing the order.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Look up and move the entry to the front.
    pub fn renew(&mut self, key: &K) -> Option<&V> {
        let at = self.entries.iter().position(|(k, _)| k == key)?;
        let entry = self.entries.remove(at).expect("position was just found");
        self.entries.push_front(entry);
        self.entries.front().map(|(_, v)| v)
    }

    /// Insert at the most-recently-used position.
    pub fn insert(&mut self, key: K, value: V) {
        self.entries.push_front((key, value));
    }

    /// Remove an entry.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let at = self.entries.iter().position(|(k, _)| k == key)?;
        self.entries.remove(at).map(|(_, v)| v)
    }

    /// Iterate entries, most-recently-used first.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Keys in oldest-first order (the trim walk order).
    pub fn keys_oldest_first(&self) -> Vec<&K> {
        self.entries.iter().rev().map(|(k, _)| k).collect()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
