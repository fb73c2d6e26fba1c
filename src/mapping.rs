//! Identifier Map
//!
//! Durable cross-reference between library item ids (ABS) and marketplace
//! product ids (ASINs). One target per source; re-matching overwrites.
//! Mappings never expire.
//!
//! An empty target records a known "no match" so the same item is not
//! searched again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Error, Result};

/// How a mapping was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Identifier equality (e.g. ASIN present in both records)
    Exact,
    /// Title/author similarity
    Fuzzy,
    /// Set by a person
    Manual,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Exact => "exact",
            Confidence::Fuzzy => "fuzzy",
            Confidence::Manual => "manual",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Confidence {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Ok(Confidence::Exact),
            "fuzzy" => Ok(Confidence::Fuzzy),
            "manual" => Ok(Confidence::Manual),
            other => Err(Error::Internal(format!("unknown confidence: {}", other))),
        }
    }
}

/// One source -> target mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierMapping {
    pub source_id: String,
    pub target_id: String,
    pub confidence: Confidence,
    pub matched_at: DateTime<Utc>,
}

impl IdentifierMapping {
    /// Whether this records an actual match rather than a known miss
    pub fn is_matched(&self) -> bool {
        !self.target_id.is_empty()
    }
}

/// Mapping statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MappingStats {
    pub total_mappings: u64,
    /// Mappings with a non-empty target
    pub matched_count: u64,
}

/// Durable storage for identifier mappings
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Insert or replace the mapping for `mapping.source_id`
    async fn upsert_mapping(&self, mapping: &IdentifierMapping) -> Result<()>;

    async fn get_mapping(&self, source_id: &str) -> Result<Option<IdentifierMapping>>;

    /// Most recently matched mapping pointing at `target_id`
    async fn find_by_target(&self, target_id: &str) -> Result<Option<IdentifierMapping>>;

    async fn mapping_stats(&self) -> Result<MappingStats>;

    async fn clear_mappings(&self) -> Result<u64>;
}

/// Process-lifetime mapping store, used when SQLite is unavailable
#[derive(Default)]
pub struct MemoryMappingStore {
    inner: Mutex<MemoryMappings>,
}

#[derive(Default)]
struct MemoryMappings {
    by_source: HashMap<String, (IdentifierMapping, u64)>,
    seq: u64,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn upsert_mapping(&self, mapping: &IdentifierMapping) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;
        inner
            .by_source
            .insert(mapping.source_id.clone(), (mapping.clone(), seq));
        Ok(())
    }

    async fn get_mapping(&self, source_id: &str) -> Result<Option<IdentifierMapping>> {
        Ok(self
            .inner
            .lock()
            .by_source
            .get(source_id)
            .map(|(mapping, _)| mapping.clone()))
    }

    async fn find_by_target(&self, target_id: &str) -> Result<Option<IdentifierMapping>> {
        Ok(self
            .inner
            .lock()
            .by_source
            .values()
            .filter(|(mapping, _)| mapping.target_id == target_id)
            .max_by_key(|(mapping, seq)| (mapping.matched_at, *seq))
            .map(|(mapping, _)| mapping.clone()))
    }

    async fn mapping_stats(&self) -> Result<MappingStats> {
        let inner = self.inner.lock();
        Ok(MappingStats {
            total_mappings: inner.by_source.len() as u64,
            matched_count: inner
                .by_source
                .values()
                .filter(|(mapping, _)| mapping.is_matched())
                .count() as u64,
        })
    }

    async fn clear_mappings(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let count = inner.by_source.len() as u64;
        inner.by_source.clear();
        Ok(count)
    }
}

/// Bidirectional identifier map over a durable store
pub struct IdentifierMap {
    store: Arc<dyn MappingStore>,
    clock: Arc<dyn Clock>,
}

impl IdentifierMap {
    pub fn new(store: Arc<dyn MappingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Target id for `source_id`, if a match is recorded
    pub async fn lookup(&self, source_id: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get_mapping(source_id)
            .await?
            .map(|mapping| mapping.target_id))
    }

    /// Full mapping record for `source_id`
    pub async fn get(&self, source_id: &str) -> Result<Option<IdentifierMapping>> {
        self.store.get_mapping(source_id).await
    }

    /// Source id most recently mapped to `target_id`
    pub async fn reverse_lookup(&self, target_id: &str) -> Result<Option<String>> {
        if target_id.is_empty() {
            return Ok(None);
        }
        Ok(self
            .store
            .find_by_target(target_id)
            .await?
            .map(|mapping| mapping.source_id))
    }

    /// Upsert; last write wins
    pub async fn record(
        &self,
        source_id: &str,
        target_id: &str,
        confidence: Confidence,
    ) -> Result<IdentifierMapping> {
        if source_id.is_empty() {
            return Err(Error::Internal("mapping source id is empty".to_string()));
        }

        let mapping = IdentifierMapping {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            confidence,
            matched_at: self.clock.now(),
        };
        self.store.upsert_mapping(&mapping).await?;

        debug!(
            source_id = source_id,
            target_id = target_id,
            confidence = confidence.as_str(),
            "Recorded identifier mapping"
        );
        Ok(mapping)
    }

    pub async fn stats(&self) -> Result<MappingStats> {
        self.store.mapping_stats().await
    }

    /// Drop every mapping
    pub async fn clear(&self) -> Result<u64> {
        self.store.clear_mappings().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn make_map() -> (Arc<ManualClock>, IdentifierMap) {
        let clock = Arc::new(ManualClock::new());
        let map = IdentifierMap::new(Arc::new(MemoryMappingStore::new()), clock.clone());
        (clock, map)
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let (_clock, map) = make_map();

        map.record("li_1", "B0001", Confidence::Fuzzy).await.unwrap();
        map.record("li_1", "B0002", Confidence::Manual).await.unwrap();

        assert_eq!(map.lookup("li_1").await.unwrap().as_deref(), Some("B0002"));
        let full = map.get("li_1").await.unwrap().unwrap();
        assert_eq!(full.confidence, Confidence::Manual);
        assert_eq!(map.stats().await.unwrap().total_mappings, 1);
    }

    #[tokio::test]
    async fn test_reverse_lookup_prefers_most_recent() {
        let (clock, map) = make_map();

        map.record("li_1", "B0001", Confidence::Exact).await.unwrap();
        clock.advance(Duration::from_secs(1));
        map.record("li_2", "B0001", Confidence::Exact).await.unwrap();

        assert_eq!(map.reverse_lookup("B0001").await.unwrap().as_deref(), Some("li_2"));

        // same timestamp: insertion order decides
        map.record("li_1", "B0001", Confidence::Manual).await.unwrap();
        map.record("li_3", "B0001", Confidence::Manual).await.unwrap();
        assert_eq!(map.reverse_lookup("B0001").await.unwrap().as_deref(), Some("li_3"));

        assert_eq!(map.reverse_lookup("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unmatched_records() {
        let (_clock, map) = make_map();

        map.record("li_1", "B0001", Confidence::Exact).await.unwrap();
        map.record("li_2", "", Confidence::Fuzzy).await.unwrap();

        let stats = map.stats().await.unwrap();
        assert_eq!(stats.total_mappings, 2);
        assert_eq!(stats.matched_count, 1);
        assert_eq!(map.lookup("li_2").await.unwrap().as_deref(), Some(""));
        assert_eq!(map.reverse_lookup("").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_source_rejected() {
        let (_clock, map) = make_map();
        assert!(map.record("", "B0001", Confidence::Exact).await.is_err());
    }

    #[test]
    fn test_confidence_parse() {
        assert_eq!("EXACT".parse::<Confidence>().unwrap(), Confidence::Exact);
        assert_eq!("manual".parse::<Confidence>().unwrap(), Confidence::Manual);
        assert!("maybe".parse::<Confidence>().is_err());
    }
}
