//! Resilient client integration tests
//!
//! Drive `ResilientClient` end to end over a scripted transport, a manual
//! clock for limiter waits and real cache tiers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;

use common::{network_error, ok, status, test_limits, ScriptedTransport};
use shelfgate::cache::{CacheStore, Origin, SqliteStore};
use shelfgate::client::{BearerToken, ReqwestTransport, StaticHeaders};
use shelfgate::metrics::RequestOutcome;
use shelfgate::{
    AccessMetrics, Error, ManualClock, RateLimiter, RequestOptions, ResilientClient, SystemClock,
    TieredCache, Upstream,
};

struct Harness {
    clock: Arc<ManualClock>,
    limiter: Arc<RateLimiter>,
    cache: Arc<TieredCache>,
    transport: Arc<ScriptedTransport>,
    client: ResilientClient,
}

fn harness_with(transport: Arc<ScriptedTransport>, cache: Option<TieredCache>) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let limiter = Arc::new(RateLimiter::new(clock.clone()).with_limits(Upstream::Abs, test_limits()));
    let cache = Arc::new(cache.unwrap_or_else(|| TieredCache::memory_only(100, clock.clone())));
    let client = ResilientClient::new(
        Upstream::Abs,
        "http://abs.test",
        transport.clone(),
        limiter.clone(),
        cache.clone(),
    );

    Harness {
        clock,
        limiter,
        cache,
        transport,
        client,
    }
}

fn harness(script: Vec<shelfgate::Result<shelfgate::client::HttpResponse>>) -> Harness {
    harness_with(ScriptedTransport::with_script(script), None)
}

// =============================================================================
// Retry and backoff
// =============================================================================

#[tokio::test]
async fn test_throttled_three_times_then_success() {
    let h = harness(vec![status(429), status(429), status(429), ok("{\"id\":\"li_1\"}")]);

    let response = h
        .client
        .request(RequestOptions::get("/api/items/li_1"))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.attempts, 4);
    assert_eq!(h.transport.calls(), 4);
    assert_eq!(
        h.clock.sleeps(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
        ]
    );

    // one success does not undo the backoff
    let state = h.limiter.state(Upstream::Abs);
    assert_eq!(state.current_delay, Duration::from_millis(800));
    assert_eq!(state.consecutive_errors, 0);
    assert_eq!(state.consecutive_successes, 1);
}

#[tokio::test]
async fn test_throttle_budget_exhausted() {
    let h = harness((0..5).map(|_| status(429)).collect());

    let err = h
        .client
        .request(RequestOptions::get("/api/libraries"))
        .await
        .unwrap_err();

    assert_matches!(
        err,
        Error::Throttled { upstream: Upstream::Abs, attempts: 5, last_status: 429, ref path } if path == "/api/libraries"
    );
    assert!(err.is_retryable());
    assert_eq!(h.transport.calls(), 5);
}

#[tokio::test]
async fn test_server_errors_exhaust_to_unavailable() {
    let h = harness(vec![status(500), status(502), status(503)]);
    let client = h.client.with_max_attempts(3);

    let err = client
        .request(RequestOptions::get("/api/authors/a1"))
        .await
        .unwrap_err();

    assert_matches!(
        err,
        Error::UpstreamUnavailable {
            attempts: 3,
            last_status: Some(503),
            ..
        }
    );
    assert_eq!(err.status(), Some(503));
    assert_eq!(h.limiter.state(Upstream::Abs).total_failures, 3);
}

#[tokio::test]
async fn test_network_failures_are_retried() {
    let h = harness(vec![network_error(), network_error(), ok("[]")]);

    let response = h.client.request(RequestOptions::get("/api/series")).await.unwrap();
    assert_eq!(response.attempts, 3);
    assert_eq!(response.body, Bytes::from("[]"));
}

#[tokio::test]
async fn test_network_exhaustion_has_no_status() {
    let h = harness(vec![network_error(), network_error()]);
    let client = h.client.with_max_attempts(2);

    let err = client.request(RequestOptions::get("/api/me")).await.unwrap_err();
    assert_matches!(
        err,
        Error::UpstreamUnavailable { last_status: None, ref reason, .. } if reason.contains("connection reset")
    );
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let h = harness(vec![status(404)]);

    let err = h
        .client
        .request(RequestOptions::get("/api/items/gone"))
        .await
        .unwrap_err();

    assert_matches!(err, Error::InvalidRequest { status: Some(404), .. });
    assert!(!err.is_retryable());
    assert_eq!(h.transport.calls(), 1);
    assert_eq!(h.limiter.state(Upstream::Abs).current_delay, Duration::from_millis(100));
}

#[tokio::test]
async fn test_deadline_aborts_in_flight_call() {
    let transport = ScriptedTransport::slow(Duration::from_secs(5), vec![ok("late")]);
    let h = harness_with(transport, None);

    let err = h
        .client
        .request(RequestOptions::get("/api/items/slow").deadline(Duration::from_millis(100)))
        .await
        .unwrap_err();

    assert_matches!(err, Error::Timeout { attempts: 1, .. });

    // the aborted call counts as a failure and the state stays usable
    let state = h.limiter.state(Upstream::Abs);
    assert_eq!(state.total_requests, 1);
    assert_eq!(state.total_failures, 1);
    assert_eq!(state.consecutive_errors, 1);
}

#[tokio::test]
async fn test_deadline_during_limiter_wait_releases_slot() {
    let clock = Arc::new(SystemClock::new());
    let limits = shelfgate::RateLimits {
        base_delay: Duration::from_millis(300),
        ..test_limits()
    };
    let limiter = Arc::new(RateLimiter::new(clock.clone()).with_limits(Upstream::Abs, limits));
    let transport = ScriptedTransport::new();
    let client = ResilientClient::new(
        Upstream::Abs,
        "http://abs.test",
        transport.clone(),
        limiter.clone(),
        Arc::new(TieredCache::memory_only(10, clock)),
    );

    client.request(RequestOptions::get("/api/me")).await.unwrap();
    let sent = limiter.state(Upstream::Abs).last_slot;

    let err = client
        .request(RequestOptions::get("/api/me").deadline(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_matches!(err, Error::Timeout { attempts: 0, .. });

    // nothing was sent, nothing was charged
    let state = limiter.state(Upstream::Abs);
    assert_eq!(state.last_slot, sent);
    assert_eq!(state.total_requests, 1);
    assert_eq!(state.total_failures, 0);
    assert_eq!(transport.calls(), 1);

    // the next caller waits out the remaining spacing only
    let started = std::time::Instant::now();
    client.request(RequestOptions::get("/api/me")).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(450));
    assert_eq!(limiter.state(Upstream::Abs).total_requests, 2);
}

#[tokio::test]
async fn test_malformed_header_fails_fast() {
    let clock = Arc::new(ManualClock::new());
    let limiter = Arc::new(RateLimiter::new(clock.clone()).with_limits(Upstream::Audible, test_limits()));
    let client = ResilientClient::new(
        Upstream::Audible,
        "http://127.0.0.1:9",
        Arc::new(ReqwestTransport::new("shelfgate-test").unwrap()),
        limiter.clone(),
        Arc::new(TieredCache::memory_only(10, clock.clone())),
    )
    .with_credentials(Arc::new(
        StaticHeaders::default().with_header("bad header name", "v"),
    ));

    let err = client
        .request(RequestOptions::get("/1.0/library"))
        .await
        .unwrap_err();

    assert_matches!(err, Error::InvalidRequest { status: None, upstream: Upstream::Audible, .. });
    assert!(!err.is_retryable());
    assert!(clock.sleeps().is_empty());

    let state = limiter.state(Upstream::Audible);
    assert_eq!(state.total_failures, 0);
    assert_eq!(state.current_delay, test_limits().base_delay);
}

// =============================================================================
// Caching
// =============================================================================

#[tokio::test]
async fn test_cache_hit_skips_limiter_and_network() {
    let h = harness(vec![ok("{\"asin\":\"B00X\"}")]);
    let options = RequestOptions::get("/1.0/catalog/products/B00X").cached("catalog", "B00X");

    let first = h.client.request(options.clone()).await.unwrap();
    let second = h.client.request(options).await.unwrap();

    assert_eq!(first.origin, Origin::Fetched);
    assert!(second.from_cache());
    assert_eq!(second.body, first.body);
    assert_eq!(h.transport.calls(), 1);
    assert_eq!(h.limiter.state(Upstream::Abs).total_requests, 1);
}

#[tokio::test]
async fn test_expired_entry_refetched() {
    let h = harness(vec![ok("v1"), ok("v2")]);
    let options = RequestOptions::get("/api/libraries")
        .cached("abs_libraries", "all")
        .ttl(Duration::from_secs(60));

    assert_eq!(h.client.request(options.clone()).await.unwrap().text(), "v1");
    h.clock.advance(Duration::from_secs(61));
    let response = h.client.request(options).await.unwrap();

    assert_eq!(response.text(), "v2");
    assert_eq!(response.origin, Origin::Fetched);
}

#[tokio::test]
async fn test_failed_fetch_is_not_cached() {
    let h = harness(vec![status(404), ok("found")]);
    let options = RequestOptions::get("/api/items/x").cached("abs_items", "x");

    assert!(h.client.request(options.clone()).await.is_err());
    assert_eq!(h.cache.get("abs_items", "x").await, None);
    assert_eq!(h.client.request(options).await.unwrap().text(), "found");
}

#[tokio::test]
async fn test_disabled_cache_always_hits_network() {
    let clock = Arc::new(ManualClock::new());
    let h = harness_with(ScriptedTransport::new(), Some(TieredCache::disabled(clock)));
    let options = RequestOptions::get("/1.0/library").cached("library", "page_1");

    for _ in 0..3 {
        let response = h.client.request(options.clone()).await.unwrap();
        assert_eq!(response.origin, Origin::Fetched);
    }

    assert_eq!(h.transport.calls(), 3);
    let stats = h.cache.stats().await;
    assert_eq!(stats.total_entries, 0);
    assert_eq!(stats.counters.writes, 0);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_fetch() {
    let transport = ScriptedTransport::slow(Duration::from_millis(50), vec![ok("shared")]);
    let h = harness_with(transport, None);
    let options = RequestOptions::get("/1.0/catalog/products/B01").cached("catalog", "B01");

    let (a, b) = tokio::join!(
        h.client.request(options.clone()),
        h.client.request(options.clone())
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(h.transport.calls(), 1);
    assert_eq!(a.body, Bytes::from("shared"));
    assert_eq!(b.body, Bytes::from("shared"));
    assert!(a.from_cache() != b.from_cache());
}

#[tokio::test]
async fn test_persisted_entry_survives_new_cache() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
        let store: Arc<dyn CacheStore> = Arc::new(SqliteStore::open(&path).await.unwrap());
        let clock = Arc::new(ManualClock::new());
        let cache = TieredCache::new(store, 10, clock);
        let h = harness_with(ScriptedTransport::with_script(vec![ok("persisted")]), Some(cache));

        h.client
            .request(RequestOptions::get("/api/authors/a1").cached("abs_authors", "a1"))
            .await
            .unwrap();
    }

    let store: Arc<dyn CacheStore> = Arc::new(SqliteStore::open(&path).await.unwrap());
    let clock = Arc::new(ManualClock::new());
    let h = harness_with(ScriptedTransport::new(), Some(TieredCache::new(store, 10, clock)));

    let response = h
        .client
        .request(RequestOptions::get("/api/authors/a1").cached("abs_authors", "a1"))
        .await
        .unwrap();

    assert_eq!(response.origin, Origin::Persisted);
    assert_eq!(response.text(), "persisted");
    assert_eq!(h.transport.calls(), 0);
}

// =============================================================================
// Credentials and metrics
// =============================================================================

#[tokio::test]
async fn test_credentials_and_query_forwarded() {
    let h = harness(vec![ok("[]")]);
    let client = h
        .client
        .with_credentials(Arc::new(BearerToken::new("secret")));

    client
        .request(
            RequestOptions::get("api/libraries/lib_1/items")
                .param("limit", 100)
                .param("page", 2),
        )
        .await
        .unwrap();

    let requests = h.transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, "http://abs.test/api/libraries/lib_1/items");
    assert_eq!(requests[0].header("Authorization"), Some("Bearer secret"));
    assert_eq!(
        requests[0].query,
        vec![
            ("limit".to_string(), "100".to_string()),
            ("page".to_string(), "2".to_string()),
        ]
    );
    assert_eq!(requests[0].timeout, Some(Duration::from_secs(30)));
}

#[tokio::test]
async fn test_static_headers_on_every_attempt() {
    let h = harness(vec![status(503), ok("{}")]);
    let client = h.client.with_credentials(Arc::new(
        StaticHeaders::default().with_header("x-adp-token", "adp"),
    ));

    client.request(RequestOptions::get("/1.0/wishlist")).await.unwrap();

    let requests = h.transport.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.header("x-adp-token") == Some("adp")));
}

#[tokio::test]
async fn test_metrics_track_outcomes_and_retries() {
    let metrics = Arc::new(AccessMetrics::new().unwrap());
    let h = harness(vec![status(429), status(500), ok("{}")]);
    let client = h.client.with_metrics(metrics.clone());

    client
        .request(RequestOptions::get("/api/items/1").cached("abs_items", "1"))
        .await
        .unwrap();
    client
        .request(RequestOptions::get("/api/items/1").cached("abs_items", "1"))
        .await
        .unwrap();

    assert_eq!(metrics.requests(Upstream::Abs, RequestOutcome::Throttled), 1);
    assert_eq!(metrics.requests(Upstream::Abs, RequestOutcome::ServerError), 1);
    assert_eq!(metrics.requests(Upstream::Abs, RequestOutcome::Success), 1);
    assert_eq!(metrics.retries(Upstream::Abs), 2);

    let text = metrics.encode_text().unwrap();
    assert!(text.contains("shelfgate_cache_lookups_total{result=\"memory_hit\"} 1"));
    assert!(text.contains("shelfgate_cache_lookups_total{result=\"miss\"} 1"));
}
