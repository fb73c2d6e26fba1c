//! Per-key async lock table
//!
//! Serializes same-key cache work (writes, promotions, read-through
//! fetches) while leaving distinct keys independent. Idle keys are dropped
//! from the table when their last holder releases.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::entry::CacheKey;

#[derive(Default)]
pub(crate) struct KeyLocks {
    locks: DashMap<CacheKey, Arc<Mutex<()>>>,
}

/// Exclusive hold on one key
pub(crate) struct KeyGuard<'a> {
    table: &'a KeyLocks,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub(crate) async fn lock(&self, key: &CacheKey) -> KeyGuard<'_> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;

        KeyGuard {
            table: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// True while `key` is held or awaited
    pub(crate) fn is_held(&self, key: &CacheKey) -> bool {
        self.locks
            .get(key)
            .map(|mutex| Arc::strong_count(mutex.value()) > 1)
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // release first so the count below only sees waiters
        self.guard.take();
        self.table
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_table_empties_after_release() {
        let locks = KeyLocks::new();
        let key = CacheKey::new("ns", "k");

        {
            let _guard = locks.lock(&key).await;
            assert_eq!(locks.len(), 1);
            assert!(locks.is_held(&key));
        }
        assert_eq!(locks.len(), 0);
        assert!(!locks.is_held(&key));
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::new());
        let key = CacheKey::new("ns", "k");

        let guard = locks.lock(&key).await;

        let waiter = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock(&CacheKey::new("ns", "a")).await;
        let _b = locks.lock(&CacheKey::new("ns", "b")).await;
        assert_eq!(locks.len(), 2);
    }
}
