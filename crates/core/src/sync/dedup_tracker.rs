//! Two-tier membership tracking over entity ids.
//!
//! - An in-flight LRU with a short TTL guards against the same entity being
//!   handled twice within one burst (`try_mark_duplicate`).
//! - A processed LRU plus an append-only bloom filter remember every entity
//!   that was accepted for persistence (`has_been_processed`).
//!
//! None of these checks are atomic across calls; the hot cache and the store's
//! timestamp-gated upsert decide correctness.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::bloom::BloomFilter;
use super::lock_unpoisoned;
use crate::config::SyncConfig;

/// Sizing for a [`DedupTracker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupSettings {
    pub bloom_expected_items: u64,
    pub bloom_false_positive_rate: f64,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            bloom_expected_items: 2_000_000,
            bloom_false_positive_rate: 0.001,
            cache_capacity: 50_000,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl From<&SyncConfig> for DedupSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            bloom_expected_items: config.bloom_expected_items,
            bloom_false_positive_rate: config.bloom_false_positive_rate,
            cache_capacity: config.dedup_cache_capacity,
            cache_ttl: Duration::from_secs(config.dedup_cache_ttl_secs),
        }
    }
}

struct DedupState {
    in_flight: LruCache<String, Instant>,
    processed: LruCache<String, ()>,
    bloom: BloomFilter,
}

pub struct DedupTracker {
    state: Mutex<DedupState>,
    ttl: Duration,
}

impl DedupTracker {
    pub fn new(settings: DedupSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(DedupState {
                in_flight: LruCache::new(capacity),
                processed: LruCache::new(capacity),
                bloom: BloomFilter::with_rate(
                    settings.bloom_expected_items,
                    settings.bloom_false_positive_rate,
                ),
            }),
            ttl: settings.cache_ttl,
        }
    }

    /// Returns `true` when `id` was already seen within the TTL and the caller
    /// should skip it. Otherwise records `id` and returns `false`.
    pub fn try_mark_duplicate(&self, id: &str) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(seen_at) = state.in_flight.get(id) {
            if seen_at.elapsed() < self.ttl {
                return true;
            }
        }
        state.in_flight.put(id.to_string(), Instant::now());
        false
    }

    /// `true` if `id` was accepted for persistence before. May report false
    /// positives through the bloom filter, never false negatives.
    pub fn has_been_processed(&self, id: &str) -> bool {
        let state = lock_unpoisoned(&self.state);
        state.processed.contains(id) || state.bloom.contains(id)
    }

    /// Call only once a value has been accepted for persistence.
    pub fn mark_as_processed(&self, id: &str) {
        let mut state = lock_unpoisoned(&self.state);
        state.processed.put(id.to_string(), ());
        state.bloom.add(id);
    }

    /// Number of ids ever marked as processed.
    pub fn processed_count(&self) -> u64 {
        lock_unpoisoned(&self.state).bloom.count()
    }
}

impl Default for DedupTracker {
    fn default() -> Self {
        Self::new(DedupSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tracker(ttl: Duration) -> DedupTracker {
        DedupTracker::new(DedupSettings {
            bloom_expected_items: 10_000,
            bloom_false_positive_rate: 0.001,
            cache_capacity: 4,
            cache_ttl: ttl,
        })
    }

    #[test]
    fn try_mark_duplicate_flags_second_call() {
        let tracker = small_tracker(Duration::from_secs(60));
        assert!(!tracker.try_mark_duplicate("bafy1"));
        assert!(tracker.try_mark_duplicate("bafy1"));
        assert!(!tracker.try_mark_duplicate("bafy2"));
    }

    #[test]
    fn try_mark_duplicate_expires_after_ttl() {
        let tracker = small_tracker(Duration::ZERO);
        assert!(!tracker.try_mark_duplicate("bafy1"));
        assert!(!tracker.try_mark_duplicate("bafy1"));
    }

    #[test]
    fn in_flight_marks_do_not_count_as_processed() {
        let tracker = small_tracker(Duration::from_secs(60));
        tracker.try_mark_duplicate("bafy1");
        assert!(!tracker.has_been_processed("bafy1"));
    }

    #[test]
    fn processed_survives_lru_eviction_through_bloom() {
        let tracker = small_tracker(Duration::from_secs(60));
        for i in 0..20 {
            tracker.mark_as_processed(&format!("bafy{}", i));
        }
        // Capacity is 4: early ids left the LRU but remain in the bloom filter.
        for i in 0..20 {
            assert!(tracker.has_been_processed(&format!("bafy{}", i)));
        }
        assert_eq!(tracker.processed_count(), 20);
    }

    #[test]
    fn unknown_id_is_not_processed() {
        let tracker = small_tracker(Duration::from_secs(60));
        tracker.mark_as_processed("bafy1");
        assert!(!tracker.has_been_processed("bafy-other"));
    }
}
