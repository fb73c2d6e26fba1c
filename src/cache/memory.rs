//! Memory layer - bounded in-process LRU
//!
//! A hash map for lookups plus an ordered index of access ticks. Every hit
//! or write moves the entry to the newest tick; inserting past capacity
//! evicts from the oldest end.
//!
//! ```text
//!   order: BTreeMap<tick, key>
//!   ┌─────┬─────┬─────┬─────┐
//!   │  3  │  7  │  8  │ 12  │  ◀── newest
//!   └─────┴─────┴─────┴─────┘
//!     ▲
//!     └── evicted first
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::entry::{CacheEntry, CacheKey};
use super::store::{CacheStore, StoreStats};
use crate::error::Result;

struct Slot {
    entry: CacheEntry,
    tick: u64,
}

#[derive(Default)]
struct Lru {
    map: HashMap<CacheKey, Slot>,
    order: BTreeMap<u64, CacheKey>,
    next_tick: u64,
    bytes: u64,
}

impl Lru {
    fn bump(&mut self, key: &CacheKey) {
        let tick = self.next_tick;
        if let Some(slot) = self.map.get_mut(key) {
            self.order.remove(&slot.tick);
            slot.tick = tick;
            self.order.insert(tick, key.clone());
            self.next_tick += 1;
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let slot = self.map.remove(key)?;
        self.order.remove(&slot.tick);
        self.bytes -= slot.entry.size() as u64;
        Some(slot.entry)
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.remove(&entry.key);

        let tick = self.next_tick;
        self.next_tick += 1;
        self.bytes += entry.size() as u64;
        self.order.insert(tick, entry.key.clone());
        self.map.insert(entry.key.clone(), Slot { entry, tick });
    }

    fn pop_oldest(&mut self) -> Option<CacheEntry> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.map.remove(&key)?;
        self.bytes -= slot.entry.size() as u64;
        Some(slot.entry)
    }

    fn retain(&mut self, mut keep: impl FnMut(&CacheEntry) -> bool) -> Vec<CacheKey> {
        let doomed: Vec<CacheKey> = self
            .map
            .values()
            .filter(|slot| !keep(&slot.entry))
            .map(|slot| slot.entry.key.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed
    }
}

/// Bounded LRU store
pub struct MemoryStore {
    inner: Mutex<Lru>,
    capacity: usize,
    evictions: AtomicU64,
}

impl MemoryStore {
    /// Create a store holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Lru::default()),
            capacity,
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resident entries, live or not
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries evicted for capacity since creation
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Resident keys from least to most recently used
    pub fn keys_by_recency(&self) -> Vec<CacheKey> {
        self.inner.lock().order.values().cloned().collect()
    }

    /// Synchronous lookup; refreshes recency on a live hit and drops an
    /// expired entry on sight
    pub fn lookup(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let mut lru = self.inner.lock();

        let live = match lru.map.get(key) {
            None => return None,
            Some(slot) => slot.entry.is_live(now),
        };

        if !live {
            lru.remove(key);
            return None;
        }

        lru.bump(key);
        lru.map.get(key).map(|slot| slot.entry.clone())
    }

    /// Synchronous insert with LRU eviction
    pub fn insert(&self, entry: CacheEntry) {
        if self.capacity == 0 {
            return;
        }

        let mut lru = self.inner.lock();
        lru.insert(entry);

        while lru.map.len() > self.capacity {
            if lru.pop_oldest().is_none() {
                break;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn remove_where(&self, predicate: impl Fn(&CacheEntry) -> bool) -> Vec<CacheKey> {
        self.inner.lock().retain(|entry| !predicate(entry))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        Ok(self.lookup(key, now))
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        self.insert(entry);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.inner.lock().remove(key).is_some())
    }

    async fn touch(
        &self,
        key: &CacheKey,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut lru = self.inner.lock();
        match lru.map.get_mut(key) {
            Some(slot) if slot.entry.is_live(now) => {
                slot.entry.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        Ok(self.remove_where(|e| e.key.namespace == namespace).len() as u64)
    }

    async fn clear_all(&self) -> Result<u64> {
        let mut lru = self.inner.lock();
        let count = lru.map.len() as u64;
        *lru = Lru::default();
        Ok(count)
    }

    async fn delete_by_prefix(&self, namespace: &str, prefix: &str) -> Result<u64> {
        let removed =
            self.remove_where(|e| e.key.namespace == namespace && e.key.key.starts_with(prefix));
        Ok(removed.len() as u64)
    }

    async fn delete_matching(&self, fragment: &str) -> Result<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        for key in self.remove_where(|e| e.key.key.contains(fragment)) {
            *counts.entry(key.namespace).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        Ok(self.remove_where(|e| !e.is_live(now)).len() as u64)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats> {
        let lru = self.inner.lock();
        let mut stats = StoreStats {
            total_entries: lru.map.len() as u64,
            size_bytes: lru.bytes,
            ..Default::default()
        };
        for slot in lru.map.values() {
            if !slot.entry.is_live(now) {
                stats.expired_entries += 1;
            }
            *stats
                .namespaces
                .entry(slot.entry.key.namespace.clone())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn make_entry(ns: &str, key: &str, now: DateTime<Utc>, ttl_secs: u64) -> CacheEntry {
        CacheEntry::new(
            CacheKey::new(ns, key),
            Bytes::from(format!("{}:{}", ns, key)),
            now,
            Duration::from_secs(ttl_secs),
        )
        .unwrap()
    }

    #[test]
    fn test_lru_eviction_order() {
        let now = Utc::now();
        let store = MemoryStore::new(3);

        store.insert(make_entry("ns", "a", now, 60));
        store.insert(make_entry("ns", "b", now, 60));
        store.insert(make_entry("ns", "c", now, 60));

        // touching "a" makes "b" the oldest
        assert!(store.lookup(&CacheKey::new("ns", "a"), now).is_some());
        store.insert(make_entry("ns", "d", now, 60));

        assert_eq!(store.len(), 3);
        assert_eq!(store.evictions(), 1);
        assert!(store.lookup(&CacheKey::new("ns", "b"), now).is_none());
        assert_eq!(
            store.keys_by_recency(),
            vec![
                CacheKey::new("ns", "c"),
                CacheKey::new("ns", "a"),
                CacheKey::new("ns", "d"),
            ]
        );
    }

    #[test]
    fn test_replace_does_not_grow() {
        let now = Utc::now();
        let store = MemoryStore::new(2);

        store.insert(make_entry("ns", "a", now, 60));
        store.insert(make_entry("ns", "a", now, 120));

        assert_eq!(store.len(), 1);
        assert_eq!(store.evictions(), 0);
        let entry = store.lookup(&CacheKey::new("ns", "a"), now).unwrap();
        assert_eq!(entry.remaining(now), Duration::from_secs(120));
    }

    #[test]
    fn test_expired_lookup_drops_entry() {
        let now = Utc::now();
        let store = MemoryStore::new(10);
        store.insert(make_entry("ns", "a", now, 1));

        let later = now + chrono::Duration::seconds(2);
        assert!(store.lookup(&CacheKey::new("ns", "a"), later).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_namespace_operations() {
        let now = Utc::now();
        let store = MemoryStore::new(100);
        store.insert(make_entry("library", "B00ASIN1", now, 60));
        store.insert(make_entry("catalog", "B00ASIN1_full", now, 60));
        store.insert(make_entry("catalog", "B00OTHER", now, 60));
        store.insert(make_entry("audible_wishlist", "wishlist_p1", now, 60));
        store.insert(make_entry("audible_wishlist", "wishlist_p2", now, 60));

        let matched = store.delete_matching("B00ASIN1").await.unwrap();
        assert_eq!(matched.get("library"), Some(&1));
        assert_eq!(matched.get("catalog"), Some(&1));

        assert_eq!(store.delete_by_prefix("audible_wishlist", "wishlist_").await.unwrap(), 2);
        assert_eq!(store.clear_namespace("catalog").await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_touch_and_cleanup() {
        let now = Utc::now();
        let store = MemoryStore::new(10);
        store.insert(make_entry("ns", "short", now, 1));
        store.insert(make_entry("ns", "long", now, 600));

        let key = CacheKey::new("ns", "short");
        let extended = now + chrono::Duration::seconds(30);
        assert!(store.touch(&key, extended, now).await.unwrap());

        let later = now + chrono::Duration::seconds(60);
        let stats = store.stats(later).await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.expired_entries, 1);

        assert_eq!(store.cleanup_expired(later).await.unwrap(), 1);
        assert_eq!(store.cleanup_expired(later).await.unwrap(), 0);
        assert!(!store.touch(&key, extended, later).await.unwrap());
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let store = MemoryStore::new(0);
        store.insert(make_entry("ns", "a", Utc::now(), 60));
        assert!(store.is_empty());
    }
}
