//! Tiered Cache - memory layer over the persisted store
//!
//! ```text
//!   get ──▶ memory ──hit──▶ value
//!             │ miss
//!             ▼  (key lock)
//!           persisted ──hit──▶ promote to memory ──▶ value
//!             │ miss
//!             ▼
//!           None / fetch ──▶ write-through both layers
//! ```
//!
//! The persisted store is the source of truth. When it fails, the error is
//! logged and counted and the memory layer carries on alone; requests never
//! fail because of the cache.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::entry::{expiry, CacheEntry, CacheKey};
use super::flight::KeyLocks;
use super::memory::MemoryStore;
use super::metrics::{CacheCounters, CacheMetrics};
use super::store::{CacheStore, StoreStats};
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Where a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Memory,
    Persisted,
    Fetched,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Memory => "memory",
            Origin::Persisted => "persisted",
            Origin::Fetched => "fetched",
        }
    }

    pub fn is_cached(&self) -> bool {
        !matches!(self, Origin::Fetched)
    }
}

/// Read-through result
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    pub value: Bytes,
    pub origin: Origin,
}

/// Aggregate cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    /// Running without the persisted layer
    pub degraded: bool,
    pub total_entries: u64,
    pub memory_entries: u64,
    pub memory_capacity: u64,
    pub memory_evictions: u64,
    pub expired_entries: u64,
    pub per_namespace_counts: BTreeMap<String, u64>,
    pub store_size_bytes: u64,
    pub counters: CacheCounters,
}

/// Two-level read-through / write-through cache
pub struct TieredCache {
    memory: MemoryStore,
    persisted: Option<Arc<dyn CacheStore>>,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
    metrics: CacheMetrics,
    enabled: bool,
    default_ttl: Duration,
}

impl TieredCache {
    /// Memory layer of `max_memory_entries` over `persisted`
    pub fn new(
        persisted: Arc<dyn CacheStore>,
        max_memory_entries: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::build(Some(persisted), max_memory_entries, clock, true)
    }

    /// Memory layer only (degraded mode)
    pub fn memory_only(max_memory_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self::build(None, max_memory_entries, clock, true)
    }

    /// Cache that never stores anything
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self::build(None, 0, clock, false)
    }

    /// Cache that never stores anything but still inspects and clears
    /// `persisted`
    pub fn disabled_over(persisted: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self::build(Some(persisted), 0, clock, false)
    }

    fn build(
        persisted: Option<Arc<dyn CacheStore>>,
        max_memory_entries: usize,
        clock: Arc<dyn Clock>,
        enabled: bool,
    ) -> Self {
        Self {
            memory: MemoryStore::new(max_memory_entries),
            persisted,
            clock,
            locks: KeyLocks::new(),
            metrics: CacheMetrics::new(),
            enabled,
            default_ttl: Duration::from_secs(24 * 3600),
        }
    }

    /// TTL used by callers that do not pass one
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_degraded(&self) -> bool {
        self.enabled && self.persisted.is_none()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    // =========================================================================
    // Read / Write
    // =========================================================================

    /// Live value for `(namespace, key)`; memory first, then persisted
    pub async fn get(&self, namespace: &str, key: &str) -> Option<Bytes> {
        if !self.enabled {
            return None;
        }

        let key = CacheKey::new(namespace, key);
        if let Some(entry) = self.memory.lookup(&key, self.clock.now()) {
            self.metrics.record_memory_hit();
            debug!(namespace = namespace, key = %key.key, "Cache hit (memory)");
            return Some(entry.value);
        }

        let _guard = self.locks.lock(&key).await;
        self.load_locked(&key).await.map(|(value, _)| value)
    }

    /// Write through both layers; a zero TTL means "do not cache"
    pub async fn put(&self, namespace: &str, key: &str, value: impl Into<Bytes>, ttl: Duration) {
        if !self.enabled || ttl.is_zero() {
            self.metrics.record_skipped_write();
            return;
        }

        let key = CacheKey::new(namespace, key);
        let _guard = self.locks.lock(&key).await;
        self.store_locked(&key, value.into(), ttl).await;
    }

    /// Read-through with single flight.
    ///
    /// At most one `fetch` runs per key at a time; callers arriving while it
    /// runs wait for it and are served from the cache afterwards.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        namespace: &str,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<CacheLookup>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        if !self.enabled {
            self.metrics.record_fetch();
            self.metrics.record_skipped_write();
            let value = fetch().await?;
            return Ok(CacheLookup {
                value,
                origin: Origin::Fetched,
            });
        }

        let key = CacheKey::new(namespace, key);
        if let Some(entry) = self.memory.lookup(&key, self.clock.now()) {
            self.metrics.record_memory_hit();
            debug!(namespace = namespace, key = %key.key, "Cache hit (memory)");
            return Ok(CacheLookup {
                value: entry.value,
                origin: Origin::Memory,
            });
        }

        let in_flight = self.locks.is_held(&key);
        if in_flight {
            debug!(namespace = namespace, key = %key.key, "Waiting on in-flight fetch");
        }

        let _guard = self.locks.lock(&key).await;
        if let Some((value, origin)) = self.load_locked(&key).await {
            if in_flight {
                self.metrics.record_coalesced();
            }
            return Ok(CacheLookup { value, origin });
        }

        self.metrics.record_fetch();
        let value = fetch().await?;

        if ttl.is_zero() {
            self.metrics.record_skipped_write();
        } else {
            self.store_locked(&key, value.clone(), ttl).await;
        }

        Ok(CacheLookup {
            value,
            origin: Origin::Fetched,
        })
    }

    /// Caller must hold the key lock
    async fn load_locked(&self, key: &CacheKey) -> Option<(Bytes, Origin)> {
        let now = self.clock.now();

        if let Some(entry) = self.memory.lookup(key, now) {
            self.metrics.record_memory_hit();
            return Some((entry.value, Origin::Memory));
        }

        if let Some(persisted) = &self.persisted {
            match persisted.get(key, now).await {
                Ok(Some(entry)) => {
                    self.metrics.record_persisted_hit();
                    debug!(namespace = %key.namespace, key = %key.key, "Cache hit (persisted)");
                    let value = entry.value.clone();
                    self.memory.insert(entry);
                    return Some((value, Origin::Persisted));
                }
                Ok(None) => {}
                Err(e) => self.store_failed(persisted.as_ref(), "get", &e),
            }
        }

        self.metrics.record_miss();
        debug!(namespace = %key.namespace, key = %key.key, "Cache miss");
        None
    }

    /// Caller must hold the key lock
    async fn store_locked(&self, key: &CacheKey, value: Bytes, ttl: Duration) {
        let Some(entry) = CacheEntry::new(key.clone(), value, self.clock.now(), ttl) else {
            self.metrics.record_skipped_write();
            return;
        };

        if let Some(persisted) = &self.persisted {
            if let Err(e) = persisted.put(entry.clone()).await {
                self.store_failed(persisted.as_ref(), "put", &e);
            }
        }

        self.memory.insert(entry);
        self.metrics.record_write();
    }

    fn store_failed(&self, store: &dyn CacheStore, operation: &str, err: &Error) {
        self.metrics.record_store_failure();
        warn!(
            store = store.name(),
            operation = operation,
            error = %err,
            "Persisted cache unavailable, continuing with memory layer"
        );
    }

    fn unavailable(&self, store: &dyn CacheStore, operation: &str, err: Error) -> Error {
        self.store_failed(store, operation, &err);
        Error::CacheUnavailable(format!("{} {}: {}", store.name(), operation, err))
    }

    // =========================================================================
    // Single-Key Maintenance
    // =========================================================================

    /// Remove one entry from both layers; true if it existed in either
    pub async fn delete(&self, namespace: &str, key: &str) -> bool {
        let key = CacheKey::new(namespace, key);
        let _guard = self.locks.lock(&key).await;

        let mut removed = self.memory.delete(&key).await.unwrap_or(false);
        if let Some(persisted) = &self.persisted {
            match persisted.delete(&key).await {
                Ok(found) => removed |= found,
                Err(e) => self.store_failed(persisted.as_ref(), "delete", &e),
            }
        }
        removed
    }

    /// Refresh the expiry of a live entry without rewriting its value
    pub async fn touch(&self, namespace: &str, key: &str, ttl: Duration) -> bool {
        if !self.enabled {
            return false;
        }
        let now = self.clock.now();
        let Some(expires_at) = expiry(now, ttl) else {
            return false;
        };

        let key = CacheKey::new(namespace, key);
        let _guard = self.locks.lock(&key).await;

        let in_memory = self
            .memory
            .touch(&key, expires_at, now)
            .await
            .unwrap_or(false);

        match &self.persisted {
            Some(persisted) => match persisted.touch(&key, expires_at, now).await {
                Ok(found) => found,
                Err(e) => {
                    self.store_failed(persisted.as_ref(), "touch", &e);
                    in_memory
                }
            },
            None => in_memory,
        }
    }

    // =========================================================================
    // Bulk Maintenance
    // =========================================================================

    /// Remove every entry in `namespace`; returns the persisted count
    /// (memory count when degraded)
    pub async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        let in_memory = self.memory.clear_namespace(namespace).await?;

        let removed = match &self.persisted {
            Some(persisted) => persisted
                .clear_namespace(namespace)
                .await
                .map_err(|e| self.unavailable(persisted.as_ref(), "clear_namespace", e))?,
            None => in_memory,
        };

        info!(namespace = namespace, removed = removed, "Cleared cache namespace");
        Ok(removed)
    }

    /// Remove every entry
    pub async fn clear_all(&self) -> Result<u64> {
        let in_memory = self.memory.clear_all().await?;

        let removed = match &self.persisted {
            Some(persisted) => persisted
                .clear_all()
                .await
                .map_err(|e| self.unavailable(persisted.as_ref(), "clear_all", e))?,
            None => in_memory,
        };

        info!(removed = removed, "Cleared cache");
        Ok(removed)
    }

    /// Remove entries in `namespace` whose key starts with `prefix`
    pub async fn delete_by_prefix(&self, namespace: &str, prefix: &str) -> Result<u64> {
        let in_memory = self.memory.delete_by_prefix(namespace, prefix).await?;

        match &self.persisted {
            Some(persisted) => persisted
                .delete_by_prefix(namespace, prefix)
                .await
                .map_err(|e| self.unavailable(persisted.as_ref(), "delete_by_prefix", e)),
            None => Ok(in_memory),
        }
    }

    /// Remove every entry whose key contains `fragment` (e.g. an ASIN),
    /// in any namespace; counts per namespace
    pub async fn invalidate_matching(&self, fragment: &str) -> Result<BTreeMap<String, u64>> {
        if fragment.is_empty() {
            return Ok(BTreeMap::new());
        }

        let in_memory = self.memory.delete_matching(fragment).await?;

        let removed = match &self.persisted {
            Some(persisted) => persisted
                .delete_matching(fragment)
                .await
                .map_err(|e| self.unavailable(persisted.as_ref(), "delete_matching", e))?,
            None => in_memory,
        };

        debug!(fragment = fragment, namespaces = removed.len(), "Invalidated related entries");
        Ok(removed)
    }

    /// Physically purge expired entries. Safe to run concurrently with
    /// reads and writes; running it twice removes nothing the second time.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let in_memory = self.memory.cleanup_expired(now).await?;

        match &self.persisted {
            Some(persisted) => persisted
                .cleanup_expired(now)
                .await
                .map_err(|e| self.unavailable(persisted.as_ref(), "cleanup_expired", e)),
            None => Ok(in_memory),
        }
    }

    /// Entry counts, sizes and counters
    pub async fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let memory = self.memory.stats(now).await.unwrap_or_default();

        let store: StoreStats = match &self.persisted {
            Some(persisted) => match persisted.stats(now).await {
                Ok(stats) => stats,
                Err(e) => {
                    self.store_failed(persisted.as_ref(), "stats", &e);
                    memory.clone()
                }
            },
            None => memory.clone(),
        };

        CacheStats {
            enabled: self.enabled,
            degraded: self.is_degraded(),
            total_entries: store.total_entries,
            memory_entries: memory.total_entries,
            memory_capacity: self.memory.capacity() as u64,
            memory_evictions: self.memory.evictions(),
            expired_entries: store.expired_entries,
            per_namespace_counts: store.namespaces,
            store_size_bytes: store.size_bytes,
            counters: self.metrics.snapshot(),
        }
    }

    /// Run `cleanup_expired` every `every` until `token` is cancelled
    pub fn spawn_cleanup(self: &Arc<Self>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let every = every.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Cache cleanup task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match cache.cleanup_expired().await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed = removed, "Purged expired cache entries"),
                            Err(e) => warn!(error = %e, "Cache cleanup failed"),
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("enabled", &self.enabled)
            .field("degraded", &self.is_degraded())
            .field("memory_entries", &self.memory.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
