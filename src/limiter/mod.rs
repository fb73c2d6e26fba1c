//! Adaptive Rate Limiter
//!
//! One independent lane per upstream. Callers reserve a send slot under a
//! short lock and sleep outside it, so a slow upstream never blocks the
//! other one. A caller dropped while waiting hands its slot back.
//!
//! ```text
//!   acquire(upstream)
//!        │
//!        ▼
//!   ┌──────────────┐  lock   ┌───────────┐
//!   │ lane(upstr.) │───────▶│ RateState │  reserve(now) -> Reservation
//!   └──────────────┘ unlock  └───────────┘
//!        │
//!        ▼
//!   clock.sleep(wait)
//!        │
//!        ▼
//!   quota bucket (GCRA)      sleep until a cell is free
//!        │
//!        ▼
//!   commit(reservation)      report_outcome(..) -> RateState::record
//! ```

mod state;

pub use state::{Outcome, RateState, Reservation};

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::RateLimits;
use crate::upstream::Upstream;

/// Shortest pause between two quota checks
const MIN_QUOTA_WAIT: Duration = Duration::from_millis(1);

/// Governor clock reading the injected monotonic timeline
#[derive(Clone)]
struct LimiterClock(Arc<dyn Clock>);

impl governor::clock::Clock for LimiterClock {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        Nanos::from(self.0.monotonic())
    }
}

type QuotaBucket =
    governor::RateLimiter<NotKeyed, InMemoryState, LimiterClock, NoOpMiddleware<Nanos>>;

struct Lane {
    limits: RateLimits,
    state: Mutex<RateState>,
    /// Requests-per-minute cap, absent when unlimited
    quota: Option<QuotaBucket>,
}

impl Lane {
    fn new(limits: RateLimits, clock: &Arc<dyn Clock>) -> Self {
        let state = Mutex::new(RateState::new(&limits));
        let quota = NonZeroU32::new(limits.requests_per_minute).map(|rpm| {
            let burst = NonZeroU32::new(limits.burst_size).unwrap_or(NonZeroU32::MIN);
            let quota = Quota::per_minute(rpm).allow_burst(burst);
            governor::RateLimiter::direct_with_clock(quota, LimiterClock(clock.clone()))
        });
        Self {
            limits,
            state,
            quota,
        }
    }
}

/// Reserved slot that is handed back unless the caller gets to send
struct PendingSlot<'a> {
    lane: &'a Lane,
    reservation: Option<Reservation>,
}

impl PendingSlot<'_> {
    fn commit(mut self, sent_at: Duration) {
        if let Some(reservation) = self.reservation.take() {
            self.lane.state.lock().commit(reservation, sent_at);
        }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            self.lane.state.lock().release(reservation);
        }
    }
}

/// Per-upstream adaptive delay scheduler
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    lanes: DashMap<Upstream, Arc<Lane>>,
}

impl RateLimiter {
    /// Create a limiter with no configured lanes; unknown upstreams get
    /// their default limits on first use
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            lanes: DashMap::new(),
        }
    }

    /// Configure (or reset) the lane for one upstream
    pub fn with_limits(self, upstream: Upstream, limits: RateLimits) -> Self {
        let lane = Lane::new(limits, &self.clock);
        self.lanes.insert(upstream, Arc::new(lane));
        self
    }

    fn lane(&self, upstream: Upstream) -> Arc<Lane> {
        self.lanes
            .entry(upstream)
            .or_insert_with(|| {
                let limits = match upstream {
                    Upstream::Abs => RateLimits::abs(),
                    Upstream::Audible => RateLimits::audible(),
                };
                Arc::new(Lane::new(limits, &self.clock))
            })
            .clone()
    }

    /// Wait until it is safe to issue the next request for `upstream`.
    ///
    /// Never fails. Returns how long the caller was held back. Dropping the
    /// future before it resolves releases the reserved slot.
    pub async fn acquire(&self, upstream: Upstream) -> Duration {
        let lane = self.lane(upstream);
        let started = self.clock.monotonic();

        let (reservation, delay) = {
            let mut state = lane.state.lock();
            let reservation = state.reserve(started, &lane.limits);
            (reservation, state.current_delay)
        };
        let pending = PendingSlot {
            lane: &lane,
            reservation: Some(reservation),
        };

        if !reservation.wait.is_zero() {
            debug!(
                upstream = %upstream,
                delay_ms = reservation.wait.as_millis() as u64,
                current_delay_ms = delay.as_millis() as u64,
                "Rate limiter holding request"
            );
            self.clock.sleep(reservation.wait).await;
        }

        if let Some(quota) = &lane.quota {
            while let Err(not_until) = quota.check() {
                let wait = not_until
                    .wait_time_from(Nanos::from(self.clock.monotonic()))
                    .max(MIN_QUOTA_WAIT);
                debug!(
                    upstream = %upstream,
                    delay_ms = wait.as_millis() as u64,
                    requests_per_minute = lane.limits.requests_per_minute,
                    "Requests-per-minute quota reached"
                );
                self.clock.sleep(wait).await;
            }
        }

        let sent_at = self.clock.monotonic();
        pending.commit(sent_at);
        sent_at.saturating_sub(started)
    }

    /// Feed the result of an attempt back into the lane
    pub fn report_outcome(&self, upstream: Upstream, outcome: Outcome) {
        let lane = self.lane(upstream);
        let mut state = lane.state.lock();
        let before = state.current_delay;

        state.record(outcome, &lane.limits);

        if state.current_delay > before {
            warn!(
                upstream = %upstream,
                outcome = outcome.as_str(),
                consecutive_errors = state.consecutive_errors,
                delay_ms = state.current_delay.as_millis() as u64,
                "Backing off"
            );
        } else if state.current_delay < before {
            debug!(
                upstream = %upstream,
                delay_ms = state.current_delay.as_millis() as u64,
                "Rate limiter recovered one step"
            );
        }
    }

    /// Snapshot of the lane state
    pub fn state(&self, upstream: Upstream) -> RateState {
        self.lane(upstream).state.lock().clone()
    }

    /// Limits in effect for `upstream`
    pub fn limits(&self, upstream: Upstream) -> RateLimits {
        self.lane(upstream).limits.clone()
    }

    /// Return a lane to its cold-start state
    pub fn reset(&self, upstream: Upstream) {
        let limits = self.lane(upstream).limits.clone();
        self.lanes
            .insert(upstream, Arc::new(Lane::new(limits, &self.clock)));
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("lanes", &self.lanes.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
