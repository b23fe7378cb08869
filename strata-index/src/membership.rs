//! Fixed-memory membership cache for content hashes.
//!
//! Two tables share one memory budget, split 1:7. A bitmap records every
//! prefix ever added and answers "definitely absent". A direct-mapped table
//! of `(key, value)` slots answers "present" when the probed slot still holds
//! the exact key; colliding inserts simply overwrite. Neither table is ever
//! invalidated, so the owner rebuilds the cache after bulk deletions.

use std::mem::size_of;

use strata_chunker::{prefix_from_hex, HashAlgorithm};

const MIN_BITS: u64 = 1024;
const MIN_SLOTS: usize = 32;

/// Outcome of a cache probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// Never added; the store need not be consulted
    NotFound,
    Found(V),
    /// Possibly added; only the store can tell
    Uncertain,
}

/// A key the cache can place
pub trait CacheKey: Eq + Clone {
    /// Uniformly distributed 64-bit prefix of the key
    fn prefix(&self) -> u64;
}

/// Prefix of a hex (or otherwise encoded) hash string
pub fn hash_prefix(hash: &str) -> u64 {
    prefix_from_hex(hash).unwrap_or_else(|| HashAlgorithm::Blake3.digest(hash.as_bytes()).prefix())
}

impl CacheKey for String {
    fn prefix(&self) -> u64 {
        hash_prefix(self)
    }
}

impl CacheKey for (String, i64) {
    fn prefix(&self) -> u64 {
        hash_prefix(&self.0) ^ (self.1 as u64).rotate_left(32)
    }
}

/// Counters and fill levels, for logging at the end of a session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub entries: u64,
    pub bits_used: u64,
    pub bit_count: u64,
    pub table_usage_ratio: f64,
    /// Uncertain probes the store resolved as present
    pub positive_misses: u64,
    /// Uncertain probes the store resolved as absent
    pub negative_misses: u64,
}

pub struct MembershipCache<K, V = ()> {
    bits: Vec<u64>,
    bit_count: u64,
    slots: Vec<Option<(K, V)>>,
    entries: u64,
    positive_misses: u64,
    negative_misses: u64,
}

impl<K: CacheKey, V: Clone> MembershipCache<K, V> {
    /// Size both tables from `memory` bytes
    pub fn new(memory: u64) -> Self {
        let bitmap_bytes = memory / 8;
        let bit_count = (bitmap_bytes * 8).max(MIN_BITS);
        let words = ((bit_count + 63) / 64) as usize;

        let table_bytes = (memory - bitmap_bytes).max(MIN_BITS) as usize;
        let slot_count = (table_bytes / size_of::<Option<(K, V)>>().max(1)).max(MIN_SLOTS);

        Self {
            bits: vec![0; words],
            bit_count,
            slots: vec![None; slot_count],
            entries: 0,
            positive_misses: 0,
            negative_misses: 0,
        }
    }

    fn bit_position(&self, prefix: u64) -> (usize, u64) {
        let bit = prefix % self.bit_count;
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    fn slot_index(&self, prefix: u64) -> usize {
        (prefix % self.slots.len() as u64) as usize
    }

    pub fn insert(&mut self, key: K, value: V) {
        let prefix = key.prefix();
        let (word, mask) = self.bit_position(prefix);
        self.bits[word] |= mask;

        let slot = self.slot_index(prefix);
        if self.slots[slot].is_none() {
            self.entries += 1;
        }
        self.slots[slot] = Some((key, value));
    }

    /// Set the miss-filter bit of `key` without storing it, so later probes
    /// for it go to the store
    pub fn mark(&mut self, key: &K) {
        let (word, mask) = self.bit_position(key.prefix());
        self.bits[word] |= mask;
    }

    /// `false` only when `key` was never inserted or marked
    pub fn might_contain(&self, key: &K) -> bool {
        let (word, mask) = self.bit_position(key.prefix());
        self.bits[word] & mask != 0
    }

    pub fn has_value(&self, key: &K) -> Lookup<V> {
        let prefix = key.prefix();
        let (word, mask) = self.bit_position(prefix);
        if self.bits[word] & mask == 0 {
            return Lookup::NotFound;
        }
        match &self.slots[self.slot_index(prefix)] {
            Some((stored, value)) if stored == key => Lookup::Found(value.clone()),
            _ => Lookup::Uncertain,
        }
    }

    /// Record how the store resolved an uncertain probe
    pub fn record_miss(&mut self, present: bool) {
        if present {
            self.positive_misses += 1;
        } else {
            self.negative_misses += 1;
        }
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
        self.slots.iter_mut().for_each(|s| *s = None);
        self.entries = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let bits_used = self.bits.iter().map(|w| w.count_ones() as u64).sum();
        CacheStats {
            entries: self.entries,
            bits_used,
            bit_count: self.bit_count,
            table_usage_ratio: self.entries as f64 / self.slots.len() as f64,
            positive_misses: self.positive_misses,
            negative_misses: self.negative_misses,
        }
    }
}

impl<K: CacheKey> MembershipCache<K, ()> {
    pub fn add(&mut self, key: K) {
        self.insert(key, ());
    }

    pub fn contains(&self, key: &K) -> Lookup<()> {
        self.has_value(key)
    }
}
