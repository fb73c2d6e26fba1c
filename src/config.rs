//! Configuration for the access layer.
//!
//! Settings are read from YAML and layered over per-upstream defaults, so a
//! file only has to name what it changes:
//!
//! ```
//! use shelfgate::Settings;
//!
//! let settings = Settings::from_yaml_str(
//!     "abs:\n  base_url: http://nas.local:13378\naudible:\n  limits:\n    requests_per_minute: 10\n",
//! ).unwrap();
//!
//! assert_eq!(settings.audible.limits.requests_per_minute, 10);
//! // untouched fields keep the Audible defaults
//! assert_eq!(settings.audible.limits.burst_size, 5);
//! ```
//!
//! Durations are written as (fractional) seconds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::upstream::Upstream;

/// Top-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Audiobookshelf server
    pub abs: UpstreamSettings,
    /// Audible marketplace
    pub audible: UpstreamSettings,
    /// Shared two-tier cache
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            abs: UpstreamSettings::abs(),
            audible: UpstreamSettings::audible(),
            cache: CacheSettings::default(),
        }
    }
}

impl Settings {
    /// Parse YAML, layering it over the defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let overrides: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        let mut merged = serde_yaml::to_value(Settings::default())?;

        // an empty document parses as null
        if !overrides.is_null() {
            overlay(&mut merged, overrides);
        }

        Ok(serde_yaml::from_value(merged)?)
    }

    /// Load settings from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Settings for one upstream
    pub fn upstream(&self, upstream: Upstream) -> &UpstreamSettings {
        match upstream {
            Upstream::Abs => &self.abs,
            Upstream::Audible => &self.audible,
        }
    }

    /// Check every section, naming the first offending field
    pub fn validate(&self) -> Result<()> {
        self.abs.validate("abs")?;
        self.audible.validate("audible")?;
        self.cache.validate()
    }
}

/// Recursively replace mapping values in `base` with those in `overrides`
fn overlay(base: &mut serde_yaml::Value, overrides: serde_yaml::Value) {
    match (base, overrides) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overrides)) => {
            for (key, value) in overrides {
                let nested = value.is_mapping()
                    && base.get(&key).map(|v| v.is_mapping()).unwrap_or(false);

                if nested {
                    if let Some(existing) = base.get_mut(&key) {
                        overlay(existing, value);
                    }
                } else {
                    base.insert(key, value);
                }
            }
        }
        (base, overrides) => *base = overrides,
    }
}

// =============================================================================
// Upstream
// =============================================================================

/// Per-upstream connection, throttling and caching settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Base URL requests are resolved against
    pub base_url: String,

    /// Credentials replayed on every request
    #[serde(default)]
    pub credentials: CredentialSettings,

    /// Adaptive rate limiting
    pub limits: RateLimits,

    /// Per-attempt transport timeout
    #[serde(with = "secs", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Total attempts per request, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// TTL for responses cached on behalf of this upstream
    #[serde(with = "secs")]
    pub cache_ttl: Duration,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    5
}

impl UpstreamSettings {
    /// Defaults for a self-hosted Audiobookshelf server
    pub fn abs() -> Self {
        Self {
            base_url: "http://localhost:13378".to_string(),
            credentials: CredentialSettings::None,
            limits: RateLimits::abs(),
            request_timeout: default_request_timeout(),
            max_attempts: default_max_attempts(),
            cache_ttl: Duration::from_secs(2 * 3600),
        }
    }

    /// Defaults for the Audible marketplace API
    pub fn audible() -> Self {
        Self {
            base_url: "https://api.audible.com".to_string(),
            credentials: CredentialSettings::None,
            limits: RateLimits::audible(),
            request_timeout: default_request_timeout(),
            max_attempts: default_max_attempts(),
            cache_ttl: Duration::from_secs(240 * 3600),
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(Error::Configuration(format!(
                "{}.base_url must be an http(s) URL, got {:?}",
                section, self.base_url
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::Configuration(format!(
                "{}.max_attempts must be at least 1",
                section
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Configuration(format!(
                "{}.request_timeout must be positive",
                section
            )));
        }
        if let CredentialSettings::Bearer { token } = &self.credentials {
            if token.trim().is_empty() {
                return Err(Error::Configuration(format!(
                    "{}.credentials.token is empty",
                    section
                )));
            }
        }
        self.limits.validate(&format!("{}.limits", section))
    }
}

/// Credentials for one upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSettings {
    /// Anonymous access
    #[default]
    None,
    /// `Authorization: Bearer <token>` (ABS API token)
    Bearer { token: String },
    /// Arbitrary headers (marketplace session headers)
    Headers { headers: BTreeMap<String, String> },
}

// =============================================================================
// Rate Limits
// =============================================================================

/// Adaptive rate limiter parameters for one upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    /// Minimum spacing between requests
    #[serde(with = "secs")]
    pub base_delay: Duration,
    /// Requests per burst before `burst_delay` applies (0 disables)
    pub burst_size: u32,
    /// Extra pause after each full burst
    #[serde(with = "secs")]
    pub burst_delay: Duration,
    /// Delay growth factor on consecutive failures
    pub backoff_multiplier: f64,
    /// Upper bound on the spacing delay
    #[serde(with = "secs")]
    pub max_delay: Duration,
    /// Consecutive successes before the delay relaxes one step
    pub recovery_requests: u32,
    /// Fixed-window cap per minute (0 disables)
    pub requests_per_minute: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::abs()
    }
}

impl RateLimits {
    /// Local library server: light spacing, no burst or window cap
    pub fn abs() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            burst_size: 0,
            burst_delay: Duration::ZERO,
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            recovery_requests: 20,
            requests_per_minute: 0,
        }
    }

    /// Marketplace API: conservative spacing, bursts of 5, 20 requests a minute
    pub fn audible() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            burst_size: 5,
            burst_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            recovery_requests: 20,
            requests_per_minute: 20,
        }
    }

    /// Validate, prefixing error messages with `section`
    pub fn validate(&self, section: &str) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::Configuration(format!(
                "{}.backoff_multiplier must be a finite number >= 1.0, got {}",
                section, self.backoff_multiplier
            )));
        }
        if self.max_delay.is_zero() {
            return Err(Error::Configuration(format!(
                "{}.max_delay must be positive",
                section
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::Configuration(format!(
                "{}.base_delay ({:?}) exceeds max_delay ({:?})",
                section, self.base_delay, self.max_delay
            )));
        }
        if self.recovery_requests == 0 {
            return Err(Error::Configuration(format!(
                "{}.recovery_requests must be at least 1",
                section
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Two-tier cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Cache responses at all
    pub enabled: bool,
    /// SQLite file backing the persisted layer
    pub db_path: PathBuf,
    /// TTL for callers that do not pass one
    #[serde(with = "secs")]
    pub default_ttl: Duration,
    /// Bound on the in-process layer
    pub max_memory_entries: usize,
    /// Period of the background expiry sweep (0 disables)
    #[serde(with = "secs")]
    pub cleanup_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: PathBuf::from(".shelfgate/cache.db"),
            default_ttl: Duration::from_secs(24 * 3600),
            max_memory_entries: crate::cache::DEFAULT_MAX_MEMORY_ENTRIES,
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl CacheSettings {
    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_memory_entries == 0 {
            return Err(Error::Configuration(
                "cache.max_memory_entries must be at least 1".to_string(),
            ));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(Error::Configuration("cache.db_path is empty".to_string()));
        }
        Ok(())
    }
}

/// Serde adapter for durations written as float seconds
mod secs {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| D::Error::custom(format!("invalid duration in seconds: {}", secs)))
    }
}
