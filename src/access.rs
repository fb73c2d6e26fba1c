//! Access Layer
//!
//! Builds and owns the shared limiter, cache, identifier map, metrics and
//! the two upstream clients, and exposes the maintenance operations.
//!
//! ```text
//!                  ┌──────────────── AccessLayer ────────────────┐
//!   abs() ────────▶│ ResilientClient(ABS) ─┐                     │
//!   audible() ────▶│ ResilientClient(AUD) ─┼─▶ RateLimiter       │
//!                  │                       ├─▶ TieredCache ─┐    │
//!   identifiers()─▶│ IdentifierMap ────────┼────────────────┴─▶ SqliteStore
//!                  │                       └─▶ AccessMetrics     │
//!                  └─────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, CacheStore, SqliteStore, TieredCache};
use crate::client::{HttpTransport, ReqwestTransport, ResilientClient};
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::mapping::{IdentifierMap, MappingStats, MappingStore, MemoryMappingStore};
use crate::metrics::AccessMetrics;
use crate::upstream::Upstream;

/// User agent sent by the default transport
pub const USER_AGENT: &str = concat!("shelfgate/", env!("CARGO_PKG_VERSION"));

/// Limiter snapshot for one upstream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterSnapshot {
    pub upstream: Upstream,
    pub current_delay_ms: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub total_failures: u64,
}

/// Combined status of the access layer
#[derive(Debug, Clone, Serialize)]
pub struct AccessReport {
    pub cache: CacheStats,
    pub mappings: MappingStats,
    pub limiters: Vec<LimiterSnapshot>,
}

/// Owner of every shared component
pub struct AccessLayer {
    settings: Settings,
    store: Option<Arc<SqliteStore>>,
    limiter: Arc<RateLimiter>,
    cache: Arc<TieredCache>,
    identifiers: Arc<IdentifierMap>,
    metrics: Arc<AccessMetrics>,
    abs: ResilientClient,
    audible: ResilientClient,
    shutdown: CancellationToken,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl AccessLayer {
    /// Build the layer with the reqwest transport and the system clock
    pub async fn open(settings: Settings) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(USER_AGENT)?);
        Self::open_with(settings, transport, Arc::new(SystemClock::new())).await
    }

    /// Build the layer over an explicit transport and clock
    pub async fn open_with(
        settings: Settings,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;

        let store = match SqliteStore::open(&settings.cache.db_path).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(
                    path = %settings.cache.db_path.display(),
                    error = %e,
                    "Persistent store unavailable, running memory-only"
                );
                None
            }
        };

        let limiter = Arc::new(
            Upstream::ALL
                .iter()
                .fold(RateLimiter::new(clock.clone()), |limiter, upstream| {
                    limiter.with_limits(*upstream, settings.upstream(*upstream).limits.clone())
                }),
        );

        let cache = match (&store, settings.cache.enabled) {
            (Some(store), true) => {
                let persisted: Arc<dyn CacheStore> = store.clone();
                TieredCache::new(persisted, settings.cache.max_memory_entries, clock.clone())
            }
            // disabled: no reads or writes, but stats and clears still reach disk
            (Some(store), false) => {
                let persisted: Arc<dyn CacheStore> = store.clone();
                TieredCache::disabled_over(persisted, clock.clone())
            }
            (None, true) => {
                TieredCache::memory_only(settings.cache.max_memory_entries, clock.clone())
            }
            (None, false) => TieredCache::disabled(clock.clone()),
        };
        let cache = Arc::new(cache.with_default_ttl(settings.cache.default_ttl));

        let mappings: Arc<dyn MappingStore> = match &store {
            Some(store) => store.clone(),
            None => Arc::new(MemoryMappingStore::new()),
        };
        let identifiers = Arc::new(IdentifierMap::new(mappings, clock.clone()));

        let metrics = Arc::new(AccessMetrics::new()?);

        let client = |upstream: Upstream| {
            ResilientClient::new(
                upstream,
                settings.upstream(upstream).base_url.clone(),
                transport.clone(),
                limiter.clone(),
                cache.clone(),
            )
            .with_settings(settings.upstream(upstream))
            .with_metrics(metrics.clone())
        };
        let abs = client(Upstream::Abs);
        let audible = client(Upstream::Audible);

        let shutdown = CancellationToken::new();
        let cleanup = if cache.is_enabled() && settings.cache.cleanup_interval > Duration::ZERO {
            Some(cache.spawn_cleanup(settings.cache.cleanup_interval, shutdown.child_token()))
        } else {
            None
        };

        info!(
            cache_enabled = cache.is_enabled(),
            degraded = cache.is_degraded(),
            db_path = %settings.cache.db_path.display(),
            "Access layer ready"
        );

        Ok(Self {
            settings,
            store,
            limiter,
            cache,
            identifiers,
            metrics,
            abs,
            audible,
            shutdown,
            cleanup: Mutex::new(cleanup),
        })
    }

    pub fn abs(&self) -> &ResilientClient {
        &self.abs
    }

    pub fn audible(&self) -> &ResilientClient {
        &self.audible
    }

    pub fn client(&self, upstream: Upstream) -> &ResilientClient {
        match upstream {
            Upstream::Abs => &self.abs,
            Upstream::Audible => &self.audible,
        }
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn identifiers(&self) -> &Arc<IdentifierMap> {
        &self.identifiers
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<AccessMetrics> {
        &self.metrics
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Cache, mapping and limiter status
    pub async fn report(&self) -> Result<AccessReport> {
        let cache = self.cache.stats().await;
        let mappings = self.identifiers.stats().await?;

        let limiters = Upstream::ALL
            .iter()
            .map(|upstream| {
                let state = self.limiter.state(*upstream);
                let limits = self.limiter.limits(*upstream);
                LimiterSnapshot {
                    upstream: *upstream,
                    current_delay_ms: state.current_delay.as_millis() as u64,
                    base_delay_ms: limits.base_delay.as_millis() as u64,
                    max_delay_ms: limits.max_delay.as_millis() as u64,
                    consecutive_errors: state.consecutive_errors,
                    consecutive_successes: state.consecutive_successes,
                    total_requests: state.total_requests,
                    total_failures: state.total_failures,
                }
            })
            .collect();

        Ok(AccessReport {
            cache,
            mappings,
            limiters,
        })
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    pub async fn clear_all(&self) -> Result<u64> {
        self.cache.clear_all().await
    }

    pub async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        self.cache.clear_namespace(namespace).await
    }

    /// Clear every namespace owned by `upstream`, reporting counts per namespace
    pub async fn clear_upstream(&self, upstream: Upstream) -> Result<BTreeMap<String, u64>> {
        let counts = try_join_all(upstream.namespaces().iter().map(|namespace| async move {
            let removed = self.cache.clear_namespace(namespace).await?;
            Ok::<_, Error>((namespace.to_string(), removed))
        }))
        .await?;
        let cleared: BTreeMap<String, u64> = counts.into_iter().collect();

        info!(
            upstream = %upstream,
            removed = cleared.values().sum::<u64>(),
            "Cleared upstream cache"
        );
        Ok(cleared)
    }

    pub async fn cleanup_expired(&self) -> Result<u64> {
        self.cache.cleanup_expired().await
    }

    /// Stop the cleanup task and checkpoint the store
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        let handle = self.cleanup.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| Error::Internal(format!("Cleanup task failed: {}", e)))?;
        }

        if let Some(store) = &self.store {
            store.close().await;
        }
        debug!("Access layer shut down");
        Ok(())
    }
}

impl Drop for AccessLayer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for AccessLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLayer")
            .field("cache", &self.cache)
            .field("abs", &self.abs)
            .field("audible", &self.audible)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
