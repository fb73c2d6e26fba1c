//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use shelfgate::client::{HttpRequest, HttpResponse, HttpTransport};
use shelfgate::{Error, RateLimits, Result};

/// Transport replaying a script of responses; answers 200 `{}` once the
/// script runs out
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
    calls: AtomicUsize,
    latency: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(script: Vec<Result<HttpResponse>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    /// Every call sleeps (in real time) before answering
    pub fn slow(latency: Duration, script: Vec<Result<HttpResponse>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            latency: Some(latency),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(HttpResponse::new(200, "{}")))
    }
}

pub fn ok(body: &str) -> Result<HttpResponse> {
    Ok(HttpResponse::new(200, body.to_string()))
}

pub fn status(code: u16) -> Result<HttpResponse> {
    Ok(HttpResponse::new(code, ""))
}

pub fn network_error() -> Result<HttpResponse> {
    Err(Error::Transport("connection reset by peer".to_string()))
}

/// 100ms base delay, doubling, no burst or window limits
pub fn test_limits() -> RateLimits {
    RateLimits {
        base_delay: Duration::from_millis(100),
        burst_size: 0,
        burst_delay: Duration::ZERO,
        backoff_multiplier: 2.0,
        max_delay: Duration::from_secs(60),
        recovery_requests: 20,
        requests_per_minute: 0,
    }
}
