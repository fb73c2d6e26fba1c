//! Two-Tier Response Cache
//!
//! Namespaced, TTL-bounded cache in front of the upstream APIs.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 TieredCache                   │
//! │   key locks (single flight) + CacheMetrics    │
//! └───────────────────────────────────────────────┘
//!          │                          │
//!          ▼                          ▼
//! ┌──────────────────┐      ┌──────────────────────┐
//! │   MemoryStore    │      │     SqliteStore      │
//! │  bounded LRU     │      │  cache_entries (WAL) │
//! └──────────────────┘      └──────────────────────┘
//! ```
//!
//! Expiry is logical: an entry past `expires_at` is never returned, but it
//! stays on disk until `cleanup_expired` runs.

mod entry;
mod flight;
mod memory;
mod metrics;
mod sqlite;
mod store;
mod tiered;

pub use entry::{expiry, CacheEntry, CacheKey};
pub use memory::MemoryStore;
pub use metrics::{CacheCounters, CacheMetrics};
pub use sqlite::SqliteStore;
pub use store::{CacheStore, StoreStats};
pub use tiered::{CacheLookup, CacheStats, Origin, TieredCache};

/// Default bound on the memory layer
pub const DEFAULT_MAX_MEMORY_ENTRIES: usize = 500;
