//! Cache store abstraction
//!
//! Both layers of the tiered cache implement the same trait; liveness is
//! decided by the caller-supplied `now`, never by the store's own clock.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::entry::{CacheEntry, CacheKey};
use crate::error::Result;

/// Key-value store with namespaces and absolute expiry
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Live entry for `key`, if any
    async fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<CacheEntry>>;

    /// Insert or replace an entry
    async fn put(&self, entry: CacheEntry) -> Result<()>;

    /// Remove one entry; true if it existed
    async fn delete(&self, key: &CacheKey) -> Result<bool>;

    /// Move the expiry of a live entry; false when absent or expired
    async fn touch(
        &self,
        key: &CacheKey,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Remove every entry in `namespace`
    async fn clear_namespace(&self, namespace: &str) -> Result<u64>;

    /// Remove every entry
    async fn clear_all(&self) -> Result<u64>;

    /// Remove entries in `namespace` whose key starts with `prefix`
    async fn delete_by_prefix(&self, namespace: &str, prefix: &str) -> Result<u64>;

    /// Remove entries in any namespace whose key contains `fragment`,
    /// returning removals per namespace
    async fn delete_matching(&self, fragment: &str) -> Result<BTreeMap<String, u64>>;

    /// Physically remove entries with `expires_at <= now`
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Entry counts and size
    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats>;
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    /// All entries, live or not
    pub total_entries: u64,
    /// Entries past their expiry awaiting cleanup
    pub expired_entries: u64,
    /// Entries per namespace
    pub namespaces: BTreeMap<String, u64>,
    /// Bytes used by the store (payload bytes for the memory layer)
    pub size_bytes: u64,
}
