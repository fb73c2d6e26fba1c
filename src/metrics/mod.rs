//! Access Metrics
//!
//! Prometheus counters and histograms for upstream traffic, registered on a
//! private registry owned by the access layer.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::cache::Origin;
use crate::error::{Error, Result};
use crate::upstream::Upstream;

/// Upstream request outcome label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    Throttled,
    ServerError,
    NetworkError,
    Invalid,
    Timeout,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::Throttled => "throttled",
            RequestOutcome::ServerError => "server_error",
            RequestOutcome::NetworkError => "network_error",
            RequestOutcome::Invalid => "invalid",
            RequestOutcome::Timeout => "timeout",
        }
    }
}

/// Prometheus metrics for the access layer
#[derive(Clone)]
pub struct AccessMetrics {
    registry: Registry,
    requests: IntCounterVec,
    retries: IntCounterVec,
    cache_lookups: IntCounterVec,
    limiter_wait: HistogramVec,
}

impl AccessMetrics {
    /// Create and register every metric on a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(
                "shelfgate_upstream_requests_total",
                "Upstream HTTP attempts by outcome",
            ),
            &["upstream", "outcome"],
        )
        .map_err(metric_error)?;

        let retries = IntCounterVec::new(
            Opts::new(
                "shelfgate_upstream_retries_total",
                "Upstream attempts beyond the first",
            ),
            &["upstream"],
        )
        .map_err(metric_error)?;

        let cache_lookups = IntCounterVec::new(
            Opts::new(
                "shelfgate_cache_lookups_total",
                "Cached request lookups by result",
            ),
            &["result"],
        )
        .map_err(metric_error)?;

        let limiter_wait = HistogramVec::new(
            HistogramOpts::new(
                "shelfgate_limiter_wait_seconds",
                "Time callers were held back by the rate limiter",
            )
            .buckets(vec![0.0, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0]),
            &["upstream"],
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(requests.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(retries.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(cache_lookups.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(limiter_wait.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            requests,
            retries,
            cache_lookups,
            limiter_wait,
        })
    }

    pub fn record_request(&self, upstream: Upstream, outcome: RequestOutcome) {
        self.requests
            .with_label_values(&[upstream.as_str(), outcome.as_str()])
            .inc();
    }

    pub fn record_retry(&self, upstream: Upstream) {
        self.retries.with_label_values(&[upstream.as_str()]).inc();
    }

    pub fn record_cache_lookup(&self, origin: Origin) {
        let result = match origin {
            Origin::Memory => "memory_hit",
            Origin::Persisted => "persisted_hit",
            Origin::Fetched => "miss",
        };
        self.cache_lookups.with_label_values(&[result]).inc();
    }

    pub fn observe_wait(&self, upstream: Upstream, waited: Duration) {
        self.limiter_wait
            .with_label_values(&[upstream.as_str()])
            .observe(waited.as_secs_f64());
    }

    /// Current request count for one label pair
    pub fn requests(&self, upstream: Upstream, outcome: RequestOutcome) -> u64 {
        self.requests
            .with_label_values(&[upstream.as_str(), outcome.as_str()])
            .get()
    }

    pub fn retries(&self, upstream: Upstream) -> u64 {
        self.retries.with_label_values(&[upstream.as_str()]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("Metrics output is not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for AccessMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessMetrics").finish_non_exhaustive()
    }
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Metrics registry error: {}", e))
}
