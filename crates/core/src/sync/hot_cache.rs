//! Size-bounded LRU of the latest entity per pointer.
//!
//! `set_if_newer` is the gate that keeps older data from replacing newer data.
//! Eviction never writes back: the durable store stays the source of truth.

use chrono::Utc;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use super::lock_unpoisoned;
use super::VersionedEntity;
use crate::profiles::{normalize_pointer, ProfileEntity};

pub const DEFAULT_HOT_CACHE_CAPACITY: usize = 10_000;

/// Cached entity plus the wall-clock milliseconds at which it was accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<E> {
    pub profile: E,
    pub local_timestamp: i64,
}

pub struct HotCache<E: VersionedEntity = ProfileEntity> {
    entries: Mutex<LruCache<String, CacheEntry<E>>>,
}

impl<E: VersionedEntity> HotCache<E> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, pointer: &str) -> Option<E> {
        self.get_entry(pointer).map(|entry| entry.profile)
    }

    pub fn get_entry(&self, pointer: &str) -> Option<CacheEntry<E>> {
        let key = normalize_pointer(pointer);
        lock_unpoisoned(&self.entries).get(&key).cloned()
    }

    /// Cached entities for the given pointers, keyed by normalized pointer.
    /// Misses are simply absent from the map.
    pub fn get_many(&self, pointers: &[String]) -> HashMap<String, E> {
        let mut entries = lock_unpoisoned(&self.entries);
        pointers
            .iter()
            .map(|p| normalize_pointer(p))
            .filter_map(|key| {
                let profile = entries.get(&key)?.profile.clone();
                Some((key, profile))
            })
            .collect()
    }

    pub fn has(&self, pointer: &str) -> bool {
        lock_unpoisoned(&self.entries).contains(&normalize_pointer(pointer))
    }

    /// Stores `profile` under `pointer` when no entry exists or the existing
    /// entry is strictly older. Returns whether the cache changed.
    pub fn set_if_newer(&self, pointer: &str, profile: E) -> bool {
        self.set_if_newer_at(pointer, profile, Utc::now().timestamp_millis())
    }

    pub fn set_if_newer_at(&self, pointer: &str, profile: E, local_timestamp: i64) -> bool {
        let key = normalize_pointer(pointer);
        let mut entries = lock_unpoisoned(&self.entries);
        if let Some(existing) = entries.peek(&key) {
            if existing.profile.timestamp() >= profile.timestamp() {
                return false;
            }
        }
        entries.put(
            key,
            CacheEntry {
                profile,
                local_timestamp,
            },
        );
        true
    }

    /// Puts the store's version of `pointer` back in the cache unless the cache
    /// already holds something strictly newer. Returns whether the cache changed.
    pub fn set_from_store(&self, pointer: &str, profile: E, local_timestamp: i64) -> bool {
        let key = normalize_pointer(pointer);
        let mut entries = lock_unpoisoned(&self.entries);
        if let Some(existing) = entries.peek(&key) {
            if existing.profile.timestamp() > profile.timestamp() {
                return false;
            }
        }
        entries.put(
            key,
            CacheEntry {
                profile,
                local_timestamp,
            },
        );
        true
    }

    /// Applies `set_if_newer` per entity, keyed by each entity's pointer.
    /// Returns how many entries changed.
    pub fn set_many_if_newer(&self, profiles: Vec<E>) -> usize {
        profiles
            .into_iter()
            .filter(|profile| {
                let pointer = profile.pointer().to_string();
                self.set_if_newer(&pointer, profile.clone())
            })
            .count()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: VersionedEntity> Default for HotCache<E> {
    fn default() -> Self {
        Self::new(DEFAULT_HOT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, pointer: &str, timestamp: i64) -> ProfileEntity {
        ProfileEntity::new(id, pointer, timestamp, vec![], None, vec![])
    }

    #[test]
    fn set_if_newer_accepts_first_and_newer() {
        let cache = HotCache::new(10);
        assert!(cache.set_if_newer("0xabc", profile("a", "0xabc", 100)));
        assert!(cache.set_if_newer("0xabc", profile("b", "0xabc", 101)));
        assert_eq!(cache.get("0xabc").map(|p| p.id), Some("b".to_string()));
    }

    #[test]
    fn set_if_newer_rejects_equal_and_older() {
        let cache = HotCache::new(10);
        assert!(cache.set_if_newer("0xabc", profile("a", "0xabc", 100)));
        assert!(!cache.set_if_newer("0xabc", profile("b", "0xabc", 100)));
        assert!(!cache.set_if_newer("0xabc", profile("c", "0xabc", 50)));
        assert_eq!(cache.get("0xabc").map(|p| p.id), Some("a".to_string()));
    }

    #[test]
    fn store_version_replaces_older_or_equal_entries() {
        let cache = HotCache::new(10);
        cache.set_if_newer("0xabc", profile("stale", "0xabc", 100));

        assert!(cache.set_from_store("0xabc", profile("stored", "0xabc", 100), 7));
        assert_eq!(cache.get("0xabc").map(|p| p.id), Some("stored".to_string()));

        cache.set_if_newer("0xabc", profile("fresh", "0xabc", 300));
        assert!(!cache.set_from_store("0xabc", profile("stored", "0xabc", 200), 8));
        assert_eq!(cache.get("0xabc").map(|p| p.id), Some("fresh".to_string()));
    }

    #[test]
    fn pointer_lookups_are_case_insensitive() {
        let cache = HotCache::new(10);
        cache.set_if_newer("0xABC", profile("a", "0xabc", 1));
        assert!(cache.has("0xabc"));
        assert!(cache.has("0XAbC"));
        assert!(cache.get("0xAbc").is_some());
    }

    #[test]
    fn get_many_returns_only_hits() {
        let cache = HotCache::new(10);
        cache.set_if_newer("0xa", profile("a", "0xa", 1));
        cache.set_if_newer("0xb", profile("b", "0xb", 1));

        let found = cache.get_many(&["0xA".to_string(), "0xmissing".to_string()]);
        assert_eq!(found.len(), 1);
        assert_eq!(found.get("0xa").map(|p| p.id.as_str()), Some("a"));
    }

    #[test]
    fn set_many_if_newer_uses_entity_pointer() {
        let cache = HotCache::new(10);
        cache.set_if_newer("0xa", profile("a1", "0xa", 10));

        let changed = cache.set_many_if_newer(vec![
            profile("a0", "0xa", 5),
            profile("b1", "0xb", 1),
            profile("c1", "0xC", 1),
        ]);
        assert_eq!(changed, 2);
        assert_eq!(cache.get("0xa").map(|p| p.id), Some("a1".to_string()));
        assert!(cache.has("0xc"));
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = HotCache::new(2);
        cache.set_if_newer("0xa", profile("a", "0xa", 1));
        cache.set_if_newer("0xb", profile("b", "0xb", 1));
        assert!(cache.get("0xa").is_some());
        cache.set_if_newer("0xc", profile("c", "0xc", 1));

        assert!(cache.has("0xa"));
        assert!(!cache.has("0xb"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn entry_keeps_local_timestamp() {
        let cache = HotCache::new(2);
        cache.set_if_newer_at("0xa", profile("a", "0xa", 1), 42);
        assert_eq!(cache.get_entry("0xa").map(|e| e.local_timestamp), Some(42));
    }
}
