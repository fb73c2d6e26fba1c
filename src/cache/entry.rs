//! Cache Entry Types
//!
//! Entries are whole-value replacements keyed by `(namespace, key)` and
//! carry absolute timestamps, so liveness only depends on the clock.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::upstream::Source;

/// Cache key: namespace plus key within it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub namespace: String,
    pub key: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// A cached value with its lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Bytes,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source: Source,
}

impl CacheEntry {
    /// Build an entry created at `now` and living for `ttl`.
    ///
    /// Returns `None` for a zero TTL ("do not cache").
    pub fn new(key: CacheKey, value: Bytes, now: DateTime<Utc>, ttl: Duration) -> Option<Self> {
        let expires_at = expiry(now, ttl)?;
        let source = Source::from_namespace(&key.namespace);

        Some(Self {
            key,
            value,
            created_at: now,
            expires_at,
            source,
        })
    }

    /// Live iff `now < expires_at`
    #[inline]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Time left before expiry (zero once expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Size of the cached payload
    #[inline]
    pub fn size(&self) -> usize {
        self.value.len()
    }
}

/// `now + ttl`, or `None` when `ttl` is zero; saturates far in the future
pub fn expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    if ttl.is_zero() {
        return None;
    }
    let expires_at = chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    // persisted timestamps are millisecond precision
    let floor = now
        .checked_add_signed(chrono::Duration::milliseconds(1))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Some(expires_at.max(floor))
}
