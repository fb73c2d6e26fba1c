//! Resilient upstream client
//!
//! The only network path to an upstream. Every call goes through the cache
//! (when a cache target is given), the rate limiter and the retry policy:
//!
//! ```text
//!   request(opts)
//!     │
//!     ├─ cache target? ── live entry ──────────────▶ Response (cached)
//!     │         │ miss (single flight per key)
//!     ▼         ▼
//!   ┌─────────────────────────── attempt loop ─────────────────────────┐
//!   │ limiter.acquire ─▶ transport.send ─▶ classify                    │
//!   │   2xx  → Success      → cache write-through → Response           │
//!   │   429  → Throttled    → retry (delay grows)                      │
//!   │   5xx / network → ServerError → retry                            │
//!   │   other 4xx → InvalidRequest (no retry)                          │
//!   └──────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::credentials::{self, CredentialProvider, NoCredentials};
use super::transport::{HttpRequest, HttpResponse, HttpTransport, Method};
use crate::cache::{Origin, TieredCache};
use crate::config::UpstreamSettings;
use crate::error::{Error, Result};
use crate::limiter::{Outcome, RateLimiter};
use crate::metrics::{AccessMetrics, RequestOutcome};
use crate::upstream::Upstream;

/// Where a response should be cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTarget {
    pub namespace: String,
    pub key: String,
}

/// Parameters of one logical request
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub cache: Option<CacheTarget>,
    /// Cache TTL; `None` uses the client default, zero disables caching
    pub ttl: Option<Duration>,
    /// Caller deadline for the whole request, retries included
    pub deadline: Option<Duration>,
}

impl RequestOptions {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            body: None,
            cache: None,
            ttl: None,
            deadline: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let mut options = Self::new(Method::POST, path);
        options.body = Some(body.into());
        options
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), value.to_string()));
        self
    }

    pub fn cached(mut self, namespace: impl Into<String>, key: impl Into<String>) -> Self {
        self.cache = Some(CacheTarget {
            namespace: namespace.into(),
            key: key.into(),
        });
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Successful response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
    pub origin: Origin,
    /// Network attempts made (0 when served from cache)
    pub attempts: u32,
}

impl Response {
    pub fn from_cache(&self) -> bool {
        self.origin.is_cached()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Attempt bookkeeping that survives a cancelled request future
#[derive(Debug, Default)]
struct Progress {
    attempts: AtomicU32,
    in_flight: AtomicBool,
}

/// Per-upstream façade over limiter, cache and transport
pub struct ResilientClient {
    upstream: Upstream,
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    credentials: Arc<dyn CredentialProvider>,
    limiter: Arc<RateLimiter>,
    cache: Arc<TieredCache>,
    metrics: Option<Arc<AccessMetrics>>,
    max_attempts: u32,
    request_timeout: Duration,
    default_ttl: Duration,
}

impl ResilientClient {
    /// Client with anonymous credentials, 5 attempts and a 30s attempt timeout
    pub fn new(
        upstream: Upstream,
        base_url: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        cache: Arc<TieredCache>,
    ) -> Self {
        let default_ttl = cache.default_ttl();
        Self {
            upstream,
            base_url: base_url.into(),
            transport,
            credentials: Arc::new(NoCredentials),
            limiter,
            cache,
            metrics: None,
            max_attempts: 5,
            request_timeout: Duration::from_secs(30),
            default_ttl,
        }
    }

    /// Apply base URL, credentials, attempt budget, timeout and TTL
    pub fn with_settings(mut self, settings: &UpstreamSettings) -> Self {
        self.base_url = settings.base_url.clone();
        self.credentials = credentials::from_settings(&settings.credentials);
        self.max_attempts = settings.max_attempts.max(1);
        self.request_timeout = settings.request_timeout;
        self.default_ttl = settings.cache_ttl;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AccessMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn upstream(&self) -> Upstream {
        self.upstream
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// GET `path`, caching under `(namespace, key)` with the default TTL
    pub async fn get_cached(&self, path: &str, namespace: &str, key: &str) -> Result<Response> {
        self.request(RequestOptions::get(path).cached(namespace, key))
            .await
    }

    /// GET `path` without caching and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(RequestOptions::get(path)).await?.json()
    }

    /// Issue a request through cache, limiter and retry policy
    #[instrument(
        skip(self, options),
        fields(
            upstream = %self.upstream,
            path = %options.path,
            request_id = %Uuid::new_v4(),
        )
    )]
    pub async fn request(&self, options: RequestOptions) -> Result<Response> {
        let progress = Progress::default();

        let Some(deadline) = options.deadline else {
            return self.run(&options, &progress).await;
        };

        match tokio::time::timeout(deadline, self.run(&options, &progress)).await {
            Ok(result) => result,
            Err(_) => {
                let attempts = progress.attempts.load(Ordering::SeqCst);

                // the aborted call counts against the upstream
                if progress.in_flight.load(Ordering::SeqCst) {
                    self.limiter
                        .report_outcome(self.upstream, Outcome::ServerError);
                }
                self.record(RequestOutcome::Timeout);

                warn!(
                    attempt = attempts,
                    deadline_ms = deadline.as_millis() as u64,
                    "Request deadline elapsed"
                );
                Err(Error::Timeout {
                    upstream: self.upstream,
                    path: options.path.clone(),
                    attempts,
                    elapsed: deadline,
                })
            }
        }
    }

    async fn run(&self, options: &RequestOptions, progress: &Progress) -> Result<Response> {
        let Some(target) = &options.cache else {
            let response = self.execute(options, progress).await?;
            return Ok(self.fresh(response, progress));
        };

        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let mut fresh: Option<HttpResponse> = None;
        let slot = &mut fresh;

        let lookup = self
            .cache
            .get_or_fetch(&target.namespace, &target.key, ttl, move || async move {
                let response = self.execute(options, progress).await?;
                let body = response.body.clone();
                *slot = Some(response);
                Ok(body)
            })
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(lookup.origin);
        }

        Ok(match fresh {
            Some(response) => self.fresh(response, progress),
            None => {
                debug!(
                    namespace = %target.namespace,
                    origin = lookup.origin.as_str(),
                    "Served from cache"
                );
                Response {
                    status: 200,
                    body: lookup.value,
                    origin: lookup.origin,
                    attempts: 0,
                }
            }
        })
    }

    fn fresh(&self, response: HttpResponse, progress: &Progress) -> Response {
        Response {
            status: response.status,
            body: response.body,
            origin: Origin::Fetched,
            attempts: progress.attempts.load(Ordering::SeqCst),
        }
    }

    /// Attempt loop: acquire, send, classify, retry
    async fn execute(&self, options: &RequestOptions, progress: &Progress) -> Result<HttpResponse> {
        let url = self.url(&options.path);
        let mut last_status: Option<u16> = None;
        let mut last_reason = String::new();

        for attempt in 1..=self.max_attempts {
            let waited = self.limiter.acquire(self.upstream).await;
            if let Some(metrics) = &self.metrics {
                metrics.observe_wait(self.upstream, waited);
                if attempt > 1 {
                    metrics.record_retry(self.upstream);
                }
            }

            let request = HttpRequest {
                method: options.method.clone(),
                url: url.clone(),
                query: options.params.clone(),
                headers: self.credentials.headers().await?,
                body: options.body.clone(),
                timeout: Some(self.request_timeout),
            };

            progress.attempts.store(attempt, Ordering::SeqCst);
            progress.in_flight.store(true, Ordering::SeqCst);
            let result = self.transport.send(request).await;
            progress.in_flight.store(false, Ordering::SeqCst);

            match result {
                Ok(response) if response.is_success() => {
                    self.limiter.report_outcome(self.upstream, Outcome::Success);
                    self.record(RequestOutcome::Success);
                    debug!(attempt = attempt, status = response.status, "Upstream request succeeded");
                    return Ok(response);
                }
                Ok(response) if response.status == 429 => {
                    self.limiter.report_outcome(self.upstream, Outcome::Throttled);
                    self.record(RequestOutcome::Throttled);
                    warn!(attempt = attempt, status = 429, "Upstream throttled request");
                    last_status = Some(429);
                    last_reason = "throttled".to_string();
                }
                Ok(response) if response.status >= 500 => {
                    self.limiter.report_outcome(self.upstream, Outcome::ServerError);
                    self.record(RequestOutcome::ServerError);
                    warn!(attempt = attempt, status = response.status, "Upstream server error");
                    last_status = Some(response.status);
                    last_reason = format!("HTTP {}", response.status);
                }
                Ok(response) => {
                    // the upstream answered; only the request was wrong
                    self.limiter.report_outcome(self.upstream, Outcome::Success);
                    self.record(RequestOutcome::Invalid);
                    return Err(Error::InvalidRequest {
                        upstream: self.upstream,
                        path: options.path.clone(),
                        status: Some(response.status),
                        message: describe_rejection(&response),
                    });
                }
                Err(Error::Request(reason)) => {
                    // nothing reached the upstream
                    self.record(RequestOutcome::Invalid);
                    return Err(Error::InvalidRequest {
                        upstream: self.upstream,
                        path: options.path.clone(),
                        status: None,
                        message: reason,
                    });
                }
                Err(e) => {
                    self.limiter.report_outcome(self.upstream, Outcome::ServerError);
                    self.record(RequestOutcome::NetworkError);
                    warn!(attempt = attempt, error = %e, "Upstream unreachable");
                    last_status = None;
                    last_reason = e.to_string();
                }
            }
        }

        if last_status == Some(429) {
            Err(Error::Throttled {
                upstream: self.upstream,
                path: options.path.clone(),
                attempts: self.max_attempts,
                last_status: 429,
            })
        } else {
            Err(Error::UpstreamUnavailable {
                upstream: self.upstream,
                path: options.path.clone(),
                attempts: self.max_attempts,
                last_status,
                reason: last_reason,
            })
        }
    }

    fn record(&self, outcome: RequestOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.record_request(self.upstream, outcome);
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("upstream", &self.upstream)
            .field("base_url", &self.base_url)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Short human description of a rejected request
fn describe_rejection(response: &HttpResponse) -> String {
    let body: String = String::from_utf8_lossy(&response.body)
        .chars()
        .take(200)
        .collect();
    let body = body.trim();

    if body.is_empty() {
        reqwest::StatusCode::from_u16(response.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("rejected")
            .to_string()
    } else {
        body.to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
