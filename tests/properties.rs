//! Property tests for the limiter state machine, the cache and the
//! identifier map

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use shelfgate::limiter::{Outcome, RateState};
use shelfgate::mapping::{IdentifierMap, MemoryMappingStore};
use shelfgate::{Confidence, ManualClock, RateLimits, TieredCache};

fn limits(base_ms: u64, max_ms: u64, multiplier: f64, recovery: u32) -> RateLimits {
    RateLimits {
        base_delay: Duration::from_millis(base_ms),
        burst_size: 0,
        burst_delay: Duration::ZERO,
        backoff_multiplier: multiplier,
        max_delay: Duration::from_millis(max_ms),
        recovery_requests: recovery,
        requests_per_minute: 0,
    }
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        Just(Outcome::Success),
        Just(Outcome::Throttled),
        Just(Outcome::ServerError),
    ]
}

proptest! {
    #[test]
    fn prop_delay_stays_within_bounds(
        base_ms in 1u64..500,
        extra_ms in 0u64..10_000,
        multiplier in 1.0f64..4.0,
        recovery in 1u32..30,
        outcomes in prop::collection::vec(outcome(), 0..200),
    ) {
        let limits = limits(base_ms, base_ms + extra_ms, multiplier, recovery);
        let mut state = RateState::new(&limits);

        for outcome in outcomes {
            state.record(outcome, &limits);
            prop_assert!(state.current_delay >= limits.base_delay);
            prop_assert!(state.current_delay <= limits.max_delay);
        }
    }

    #[test]
    fn prop_throttling_never_lowers_delay(
        base_ms in 1u64..500,
        multiplier in 1.0f64..4.0,
        prefix in prop::collection::vec(outcome(), 0..50),
        throttles in 1usize..40,
    ) {
        let limits = limits(base_ms, 60_000, multiplier, 20);
        let mut state = RateState::new(&limits);
        for outcome in prefix {
            state.record(outcome, &limits);
        }

        let mut previous = state.current_delay;
        for _ in 0..throttles {
            state.record(Outcome::Throttled, &limits);
            prop_assert!(state.current_delay >= previous);
            previous = state.current_delay;
        }
    }

    #[test]
    fn prop_recovery_lowers_raised_delay(
        failures in 2usize..12,
        recovery in 1u32..30,
    ) {
        let limits = limits(100, 60_000, 2.0, recovery);
        let mut state = RateState::new(&limits);
        for _ in 0..failures {
            state.record(Outcome::ServerError, &limits);
        }
        let raised = state.current_delay;
        prop_assert!(raised > limits.base_delay);

        for _ in 0..recovery {
            state.record(Outcome::Success, &limits);
        }
        prop_assert!(state.current_delay < raised);
        prop_assert!(state.current_delay >= limits.base_delay);
    }

    #[test]
    fn prop_put_then_get_within_ttl(
        namespace in "[a-z_]{1,12}",
        key in "[A-Za-z0-9_=&]{1,24}",
        value in prop::collection::vec(any::<u8>(), 0..256),
        ttl_secs in 1u64..100_000,
        elapsed_frac in 0.0f64..1.0,
    ) {
        let clock = Arc::new(ManualClock::new());
        let cache = TieredCache::memory_only(16, clock.clone());
        let ttl = Duration::from_secs(ttl_secs);

        tokio_test::block_on(async {
            cache.put(&namespace, &key, value.clone(), ttl).await;

            clock.advance(ttl.mul_f64(elapsed_frac).min(ttl - Duration::from_millis(1)));
            let live = cache.get(&namespace, &key).await;
            prop_assert_eq!(live.as_deref(), Some(value.as_slice()));

            clock.advance(ttl);
            prop_assert_eq!(cache.get(&namespace, &key).await, None);
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_clear_namespace_is_exact(
        entries in prop::collection::btree_map(
            ("(abs_items|catalog|search)", "[a-z0-9]{1,8}"),
            any::<u8>(),
            0..40,
        ),
    ) {
        let clock = Arc::new(ManualClock::new());
        let cache = TieredCache::memory_only(100, clock);
        let ttl = Duration::from_secs(60);

        let mut expected: BTreeMap<String, u64> = BTreeMap::new();
        for (namespace, _key) in entries.keys() {
            *expected.entry(namespace.clone()).or_default() += 1;
        }

        tokio_test::block_on(async {
            for ((namespace, key), byte) in &entries {
                cache.put(namespace, key, vec![*byte], ttl).await;
            }

            let removed = cache.clear_namespace("catalog").await.unwrap();
            prop_assert_eq!(removed, expected.get("catalog").copied().unwrap_or(0));

            for (namespace, key) in entries.keys() {
                let present = cache.get(namespace, key).await.is_some();
                prop_assert_eq!(present, namespace != "catalog");
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_last_record_wins(
        source in "li_[a-z0-9]{1,10}",
        first in "B0[A-Z0-9]{8}",
        second in "B0[A-Z0-9]{8}",
    ) {
        let clock = Arc::new(ManualClock::new());
        let map = IdentifierMap::new(Arc::new(MemoryMappingStore::new()), clock.clone());

        tokio_test::block_on(async {
            map.record(&source, &first, Confidence::Fuzzy).await.unwrap();
            clock.advance(Duration::from_secs(1));
            map.record(&source, &second, Confidence::Exact).await.unwrap();

            prop_assert_eq!(map.lookup(&source).await.unwrap(), Some(second.clone()));
            prop_assert_eq!(map.reverse_lookup(&second).await.unwrap(), Some(source.clone()));
            prop_assert_eq!(map.stats().await.unwrap().total_mappings, 1);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
