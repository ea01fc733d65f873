//! Record cache
//!
//! Parsed records keyed by their byte offset in the data file. Entries live in
//! one of two tiers:
//! - strong: freshly inserted or written records
//! - demoted: low-usage records pushed out of the strong tier, still served
//!   until ranked out or the hard capacity is hit
//!
//! Every `check_interval` inserts the cache ranks entries by usage. Above the
//! weak threshold the least used strong entries are demoted, as many as half
//! of all cached entries; above the hard threshold the least used quarter of
//! everything is dropped.

use dashmap::DashMap;
use parking_lot::Mutex;
use quill_common::{CacheConfig, Record};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Cache key: data file generation plus byte offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub generation: u64,
    pub position: i64,
}

impl CacheKey {
    pub fn new(generation: u64, position: i64) -> Self {
        Self {
            generation,
            position,
        }
    }
}

struct Slot {
    record: Arc<Record>,
    usage: AtomicU64,
}

impl Slot {
    fn new(record: Arc<Record>) -> Self {
        Self {
            record,
            usage: AtomicU64::new(1),
        }
    }

    fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Entries moved from the strong to the demoted tier
    pub demotions: AtomicU64,
    /// Entries dropped by the hard threshold
    pub evictions: AtomicU64,
}

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub demotions: u64,
    pub evictions: u64,
    pub strong_entries: usize,
    pub demoted_entries: usize,
}

impl CacheSnapshot {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Usage-ranked two-tier record cache
pub struct RecordCache {
    strong: DashMap<CacheKey, Slot>,
    demoted: DashMap<CacheKey, Slot>,
    config: CacheConfig,
    inserts: AtomicU64,
    /// Held while ranking; concurrent checks are skipped
    evicting: Mutex<()>,
    stats: CacheStats,
}

impl RecordCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            strong: DashMap::new(),
            demoted: DashMap::new(),
            config,
            inserts: AtomicU64::new(0),
            evicting: Mutex::new(()),
            stats: CacheStats::default(),
        }
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            demotions: self.stats.demotions.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            strong_entries: self.strong.len(),
            demoted_entries: self.demoted.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.strong.len() + self.demoted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a record, bumping its usage on a hit
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Record>> {
        let hit = self
            .strong
            .get(key)
            .or_else(|| self.demoted.get(key))
            .map(|slot| {
                slot.usage.fetch_add(1, Ordering::Relaxed);
                Arc::clone(&slot.record)
            });

        if hit.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Insert or replace a record in the strong tier
    pub fn set(&self, key: CacheKey, record: Arc<Record>) {
        self.demoted.remove(&key);
        self.strong.insert(key, Slot::new(record));

        let inserts = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if inserts % self.config.check_interval == 0 {
            self.rebalance();
        }
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.strong.clear();
        self.demoted.clear();
    }

    fn rebalance(&self) {
        let Some(_guard) = self.evicting.try_lock() else {
            return;
        };

        let total = self.len();
        if total <= self.config.weak_threshold {
            return;
        }

        let mut ranked = rank(&self.strong);
        let demote = (total / 2).min(ranked.len());
        for key in ranked.drain(..demote) {
            if let Some((key, slot)) = self.strong.remove(&key) {
                self.demoted.insert(key, slot);
            }
        }
        self.stats
            .demotions
            .fetch_add(demote as u64, Ordering::Relaxed);

        if total <= self.config.hard_threshold {
            debug!("Demoted {} cache entries ({} total)", demote, total);
            return;
        }

        let mut everything: Vec<(u64, CacheKey)> = self
            .strong
            .iter()
            .chain(self.demoted.iter())
            .map(|entry| (entry.value().usage(), *entry.key()))
            .collect();
        everything.sort_unstable();

        let drop_count = (total / 4).max(1);
        for (_, key) in everything.into_iter().take(drop_count) {
            if self.strong.remove(&key).is_none() {
                self.demoted.remove(&key);
            }
        }
        self.stats
            .evictions
            .fetch_add(drop_count as u64, Ordering::Relaxed);
        debug!(
            "Demoted {} and evicted {} cache entries ({} total)",
            demote, drop_count, total
        );
    }
}

/// Keys of `tier` ordered by usage, oldest key first among equals
fn rank(tier: &DashMap<CacheKey, Slot>) -> Vec<CacheKey> {
    let mut ranked: Vec<(u64, CacheKey)> = tier
        .iter()
        .map(|entry| (entry.value().usage(), *entry.key()))
        .collect();
    ranked.sort_unstable();
    ranked.into_iter().map(|(_, key)| key).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_common::{Document, NOT_EXISTS, RecordState};

    fn record(id: &str) -> Arc<Record> {
        Arc::new(Record {
            stream_id: id.to_string(),
            previous: NOT_EXISTS,
            stream_length: 1,
            state: RecordState::Event,
            metadata: Document::new(),
            payload: Document::new(),
        })
    }

    fn config(weak: usize, hard: usize, check: u64) -> CacheConfig {
        CacheConfig {
            weak_threshold: weak,
            hard_threshold: hard,
            check_interval: check,
        }
    }

    #[test]
    fn test_cache_insert_and_get() {
        let cache = RecordCache::new(CacheConfig::default());
        let key = CacheKey::new(0, 128);

        cache.set(key, record("a"));
        assert_eq!(cache.get(&key).unwrap().stream_id, "a");
        assert!(cache.get(&CacheKey::new(0, 0)).is_none());

        let stats = cache.snapshot();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_generation_separates_keys() {
        let cache = RecordCache::new(CacheConfig::default());
        cache.set(CacheKey::new(0, 10), record("old"));

        assert!(cache.get(&CacheKey::new(1, 10)).is_none());
        cache.set(CacheKey::new(1, 10), record("new"));
        assert_eq!(cache.get(&CacheKey::new(1, 10)).unwrap().stream_id, "new");
        assert_eq!(cache.get(&CacheKey::new(0, 10)).unwrap().stream_id, "old");
    }

    #[test]
    fn test_demotes_least_used_half() {
        let cache = RecordCache::new(config(4, 100, 1));
        for pos in 0..4 {
            cache.set(CacheKey::new(0, pos), record("s"));
        }
        for _ in 0..2 {
            cache.get(&CacheKey::new(0, 2));
            cache.get(&CacheKey::new(0, 3));
        }
        cache.set(CacheKey::new(0, 4), record("s"));

        let stats = cache.snapshot();
        assert_eq!(stats.demotions, 2);
        assert_eq!(stats.strong_entries, 3);
        assert_eq!(stats.demoted_entries, 2);
        assert_eq!(stats.evictions, 0);

        // Demoted entries are still served
        assert!(cache.get(&CacheKey::new(0, 0)).is_some());
        assert!(cache.get(&CacheKey::new(0, 1)).is_some());
    }

    #[test]
    fn test_hard_threshold_evicts_quarter() {
        let cache = RecordCache::new(config(2, 4, 5));
        cache.set(CacheKey::new(0, 0), record("s"));
        for _ in 0..3 {
            cache.get(&CacheKey::new(0, 0));
        }
        for pos in 1..5 {
            cache.set(CacheKey::new(0, pos), record("s"));
        }

        let stats = cache.snapshot();
        assert_eq!(stats.demotions, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(cache.len(), 4);
        assert!(cache.get(&CacheKey::new(0, 1)).is_none());
        assert!(cache.get(&CacheKey::new(0, 0)).is_some());
    }

    #[test]
    fn test_demotion_counts_all_entries() {
        let cache = RecordCache::new(config(3, 100, 2));
        for pos in 0..4 {
            cache.set(CacheKey::new(0, pos), record("s"));
        }
        // 4 entries: positions 0 and 1 demoted
        assert_eq!(cache.snapshot().demoted_entries, 2);

        cache.set(CacheKey::new(0, 4), record("s"));
        cache.set(CacheKey::new(0, 5), record("s"));

        // 6 entries: half of them (3) leave the 4-entry strong tier
        let stats = cache.snapshot();
        assert_eq!(stats.demotions, 5);
        assert_eq!(stats.strong_entries, 1);
        assert_eq!(stats.demoted_entries, 5);
        assert!(cache.get(&CacheKey::new(0, 5)).is_some());
    }

    #[test]
    fn test_set_replaces_demoted_entry() {
        let cache = RecordCache::new(config(1, 100, 1));
        cache.set(CacheKey::new(0, 0), record("a"));
        cache.set(CacheKey::new(0, 1), record("b"));
        assert_eq!(cache.snapshot().demoted_entries, 1);

        cache.set(CacheKey::new(0, 0), record("c"));
        assert_eq!(cache.get(&CacheKey::new(0, 0)).unwrap().stream_id, "c");
    }

    #[test]
    fn test_clear() {
        let cache = RecordCache::new(CacheConfig::default());
        for pos in 0..10 {
            cache.set(CacheKey::new(3, pos), record("x"));
        }
        assert_eq!(cache.len(), 10);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(&CacheKey::new(3, 0)).is_none());
    }
}
