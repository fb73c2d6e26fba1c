//! Shelfgate - Resilient access layer for audiobook catalog APIs
//!
//! Every outbound call to an Audiobookshelf (ABS) server or the Audible
//! catalog API passes through one path that throttles adaptively per
//! upstream, retries transient failures and caches responses in two tiers.
//! A persistent identifier map records which ABS item matched which ASIN.
//!
//! # Architecture
//!
//! ```text
//!  caller
//!    │  request(path, params, cache target, ttl)
//!    ▼
//!  ┌──────────────────┐  miss   ┌───────────────┐  wait   ┌────────────────┐
//!  │ ResilientClient  │───────▶│  TieredCache  │        │  RateLimiter   │
//!  │  (ABS / Audible) │◀───────│ memory+SQLite │        │ per upstream   │
//!  └────────┬─────────┘  hit    └───────────────┘        └───────▲────────┘
//!           │ acquire / report_outcome                          │
//!           └───────────────────────────────────────────────────┘
//!           │ send
//!           ▼
//!     HttpTransport (reqwest)
//! ```
//!
//! # Modules
//!
//! - [`access`] - Builds and owns the shared components
//! - [`cache`] - Memory and SQLite cache tiers
//! - [`client`] - Transport port, credentials and the resilient client
//! - [`clock`] - Injectable time source
//! - [`config`] - YAML settings
//! - [`error`] - Error types
//! - [`limiter`] - Adaptive per-upstream rate limiting
//! - [`mapping`] - Persistent ABS item to ASIN map
//! - [`metrics`] - Prometheus counters
//! - [`upstream`] - Upstream and namespace identities

pub mod access;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod mapping;
pub mod metrics;
pub mod upstream;

// Re-export commonly used types
pub use access::{AccessLayer, AccessReport, LimiterSnapshot};
pub use cache::{CacheStats, TieredCache};
pub use client::{RequestOptions, ResilientClient, Response};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RateLimits, Settings};
pub use error::{Error, Result};
pub use limiter::{Outcome, RateLimiter};
pub use mapping::{Confidence, IdentifierMap, IdentifierMapping};
pub use metrics::AccessMetrics;
pub use upstream::{Source, Upstream};
