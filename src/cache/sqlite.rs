//! Persisted layer - SQLite store
//!
//! Single file, WAL journal. Holds both the cache table and the identifier
//! mapping table so the two share one connection pool.
//!
//! Timestamps are stored as Unix milliseconds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, info};

use super::entry::{CacheEntry, CacheKey};
use super::store::{CacheStore, StoreStats};
use crate::error::{Error, Result};
use crate::mapping::{Confidence, IdentifierMapping, MappingStats, MappingStore};
use crate::upstream::Source;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS cache_entries (
        namespace TEXT NOT NULL,
        key TEXT NOT NULL,
        value BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        source TEXT NOT NULL,
        PRIMARY KEY (namespace, key)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_cache_source ON cache_entries(source)",
    r#"CREATE TABLE IF NOT EXISTS identifier_mappings (
        source_id TEXT PRIMARY KEY,
        target_id TEXT NOT NULL,
        confidence TEXT NOT NULL,
        matched_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_mappings_target ON identifier_mappings(target_id)",
];

/// SQLite-backed cache and mapping store
pub struct SqliteStore {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| Error::CacheUnavailable(format!("{}: {}", path.display(), e)))?;

        let store = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        store.init_schema().await?;

        info!(path = %path.display(), "Opened SQLite cache store");
        Ok(store)
    }

    /// Private in-memory database (single connection, lives as long as the store)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool, path: None };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Database file, if not in-memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Close the pool, checkpointing the WAL
    pub async fn close(&self) {
        if self.path.is_some() {
            if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await
            {
                debug!(error = %e, "WAL checkpoint on close failed");
            }
        }
        self.pool.close().await;
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn entry_from_row(row: &SqliteRow) -> Result<CacheEntry> {
    let value: Vec<u8> = row.try_get("value")?;
    let source: String = row.try_get("source")?;

    Ok(CacheEntry {
        key: CacheKey::new(
            row.try_get::<String, _>("namespace")?,
            row.try_get::<String, _>("key")?,
        ),
        value: Bytes::from(value),
        created_at: from_millis(row.try_get("created_at")?),
        expires_at: from_millis(row.try_get("expires_at")?),
        source: Source::parse(&source),
    })
}

fn mapping_from_row(row: &SqliteRow) -> Result<IdentifierMapping> {
    let confidence: String = row.try_get("confidence")?;

    Ok(IdentifierMapping {
        source_id: row.try_get("source_id")?,
        target_id: row.try_get("target_id")?,
        confidence: confidence.parse::<Confidence>()?,
        matched_at: from_millis(row.try_get("matched_at")?),
    })
}

#[async_trait]
impl CacheStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT namespace, key, value, created_at, expires_at, source
             FROM cache_entries
             WHERE namespace = ? AND key = ? AND expires_at > ?",
        )
        .bind(&key.namespace)
        .bind(&key.key)
        .bind(millis(now))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_entries (namespace, key, value, created_at, expires_at, source)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                source = excluded.source",
        )
        .bind(&entry.key.namespace)
        .bind(&entry.key.key)
        .bind(entry.value.as_ref())
        .bind(millis(entry.created_at))
        .bind(millis(entry.expires_at))
        .bind(entry.source.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE namespace = ? AND key = ?")
            .bind(&key.namespace)
            .bind(&key.key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch(
        &self,
        key: &CacheKey,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE cache_entries SET expires_at = ?
             WHERE namespace = ? AND key = ? AND expires_at > ?",
        )
        .bind(millis(expires_at))
        .bind(&key.namespace)
        .bind(&key.key)
        .bind(millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE namespace = ?")
            .bind(namespace)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn clear_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_prefix(&self, namespace: &str, prefix: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM cache_entries
             WHERE namespace = ? AND substr(key, 1, length(?)) = ?",
        )
        .bind(namespace)
        .bind(prefix)
        .bind(prefix)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_matching(&self, fragment: &str) -> Result<BTreeMap<String, u64>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT namespace, COUNT(*) AS n FROM cache_entries
             WHERE instr(key, ?) > 0
             GROUP BY namespace",
        )
        .bind(fragment)
        .fetch_all(&mut *tx)
        .await?;

        let mut counts = BTreeMap::new();
        for row in &rows {
            let namespace: String = row.try_get("namespace")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(namespace, n as u64);
        }

        sqlx::query("DELETE FROM cache_entries WHERE instr(key, ?) > 0")
            .bind(fragment)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(counts)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(millis(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        let rows = sqlx::query(
            "SELECT namespace,
                    COUNT(*) AS n,
                    SUM(CASE WHEN expires_at <= ? THEN 1 ELSE 0 END) AS expired
             FROM cache_entries
             GROUP BY namespace",
        )
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let namespace: String = row.try_get("namespace")?;
            let n: i64 = row.try_get("n")?;
            let expired: i64 = row.try_get("expired")?;
            stats.total_entries += n as u64;
            stats.expired_entries += expired as u64;
            stats.namespaces.insert(namespace, n as u64);
        }

        let size: i64 = sqlx::query_scalar(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.size_bytes = size.max(0) as u64;

        Ok(stats)
    }
}

#[async_trait]
impl MappingStore for SqliteStore {
    async fn upsert_mapping(&self, mapping: &IdentifierMapping) -> Result<()> {
        // REPLACE re-inserts the row, so rowid also orders re-matches
        sqlx::query(
            "INSERT OR REPLACE INTO identifier_mappings (source_id, target_id, confidence, matched_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&mapping.source_id)
        .bind(&mapping.target_id)
        .bind(mapping.confidence.as_str())
        .bind(millis(mapping.matched_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_mapping(&self, source_id: &str) -> Result<Option<IdentifierMapping>> {
        let row = sqlx::query(
            "SELECT source_id, target_id, confidence, matched_at
             FROM identifier_mappings WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(mapping_from_row).transpose()
    }

    async fn find_by_target(&self, target_id: &str) -> Result<Option<IdentifierMapping>> {
        let row = sqlx::query(
            "SELECT source_id, target_id, confidence, matched_at
             FROM identifier_mappings WHERE target_id = ?
             ORDER BY matched_at DESC, rowid DESC
             LIMIT 1",
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(mapping_from_row).transpose()
    }

    async fn mapping_stats(&self) -> Result<MappingStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(CASE WHEN target_id != '' THEN 1 ELSE 0 END), 0) AS matched
             FROM identifier_mappings",
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let matched: i64 = row.try_get("matched")?;
        Ok(MappingStats {
            total_mappings: total as u64,
            matched_count: matched as u64,
        })
    }

    async fn clear_mappings(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM identifier_mappings")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
