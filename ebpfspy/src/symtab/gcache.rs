//! Generational cache
//!
//! A key/value store bounded twice:
//!
//! - **capacity**: inserting past `size` evicts the least recently seen
//!   entries, including ones touched in the current round
//! - **age**: [`GCache::next_round`] evicts every entry whose last access is
//!   more than `keep_rounds` rounds old
//!
//! The round counter is advanced by the session once per collection cycle, so
//! eviction is deterministic and independent of wall-clock time. The cache is
//! not synchronized; each tier wraps it in its own mutex.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use super::options::GCacheOptions;

struct Entry<V> {
    value: V,
    last_seen_round: u64,
    /// Position in the recency order
    tick: u64,
}

/// Size- and age-bounded cache
pub struct GCache<K, V> {
    options: GCacheOptions,
    round: u64,
    next_tick: u64,
    entries: HashMap<K, Entry<V>>,
    /// tick → key, oldest access first
    recency: BTreeMap<u64, K>,
}

/// Snapshot of a cache tier for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GCacheDebugInfo {
    pub len: usize,
    pub capacity: usize,
    pub keep_rounds: u64,
    pub round: u64,
}

impl<K, V> GCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new(options: GCacheOptions) -> Self {
        Self {
            options,
            round: 0,
            next_tick: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    /// Look up `key`, marking it as seen in the current round
    pub fn get(&mut self, key: &K) -> Option<V> {
        let tick = self.bump_tick();
        let round = self.round;
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        entry.last_seen_round = round;
        self.recency.insert(tick, key.clone());
        Some(entry.value.clone())
    }

    /// Insert or replace `key`, then enforce the capacity bound
    pub fn put(&mut self, key: K, value: V) {
        let tick = self.bump_tick();
        let entry = Entry { value, last_seen_round: self.round, tick };
        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            self.recency.remove(&previous.tick);
        }
        self.recency.insert(tick, key);

        while self.entries.len() > self.options.size {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    /// Drop `key` regardless of its age
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry.value)
    }

    /// Advance the round counter and evict entries older than `keep_rounds`
    ///
    /// Returns the number of evicted entries.
    pub fn next_round(&mut self) -> usize {
        self.round += 1;
        let round = self.round;
        let keep_rounds = self.options.keep_rounds;

        let stale: Vec<u64> = self
            .entries
            .values()
            .filter(|entry| round - entry.last_seen_round > keep_rounds)
            .map(|entry| entry.tick)
            .collect();

        for tick in &stale {
            if let Some(key) = self.recency.remove(tick) {
                self.entries.remove(&key);
            }
        }
        stale.len()
    }

    /// Membership test that does not count as an access
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn round(&self) -> u64 {
        self.round
    }

    #[must_use]
    pub fn debug_info(&self) -> GCacheDebugInfo {
        GCacheDebugInfo {
            len: self.entries.len(),
            capacity: self.options.size,
            keep_rounds: self.options.keep_rounds,
            round: self.round,
        }
    }

    fn bump_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }
}
