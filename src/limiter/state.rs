//! Per-upstream backoff state machine
//!
//! Pure bookkeeping: no clocks, no sleeping. `reserve` turns "now" into the
//! earliest permitted send slot; `commit` or `release` settles it once the
//! caller sends or gives up; `record` folds an outcome into the delay.

use std::time::Duration;

use serde::Serialize;

use crate::config::RateLimits;

/// Result of one upstream attempt, as seen by the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// 2xx
    Success,
    /// 429
    Throttled,
    /// 5xx, network failure or caller deadline
    ServerError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Throttled => "throttled",
            Outcome::ServerError => "server_error",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Success)
    }
}

/// A send slot held by one caller until it commits or releases it
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Reserved send time (monotonic)
    pub slot: Duration,
    /// How long the caller must wait from the time it reserved
    pub wait: Duration,
    previous_slot: Option<Duration>,
    previous_burst: u32,
}

/// Adaptive delay state for one upstream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateState {
    /// Backoff level; grows on every failure, relaxes after a success run
    pub current_delay: Duration,
    /// Gap before the next slot. Lags `current_delay` by one failure so the
    /// immediate retry is spaced by the delay the failed attempt ran under.
    pub spacing: Duration,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    /// Requests issued in the current burst
    pub burst_count: u32,
    /// Send time reserved by the most recent caller (monotonic)
    pub last_slot: Option<Duration>,
    /// Lifetime counters (sent requests only)
    pub total_requests: u64,
    pub total_failures: u64,
}

impl RateState {
    /// Cold-start state: base delay, nothing reserved
    pub fn new(limits: &RateLimits) -> Self {
        Self {
            current_delay: limits.base_delay,
            spacing: limits.base_delay,
            consecutive_errors: 0,
            consecutive_successes: 0,
            burst_count: 0,
            last_slot: None,
            total_requests: 0,
            total_failures: 0,
        }
    }

    /// Reserve the next send slot.
    ///
    /// The gap to the previous slot never exceeds `max_delay`.
    pub fn reserve(&mut self, now: Duration, limits: &RateLimits) -> Reservation {
        let previous_slot = self.last_slot;
        let previous_burst = self.burst_count;
        let mut slot = now;

        if let Some(last) = self.last_slot {
            let mut gap = self.spacing;
            if limits.burst_size > 0 && self.burst_count >= limits.burst_size {
                gap = gap.saturating_add(limits.burst_delay);
                self.burst_count = 0;
            }
            slot = slot.max(last.saturating_add(gap.min(limits.max_delay)));
        }

        self.burst_count += 1;
        self.last_slot = Some(slot);

        Reservation {
            slot,
            wait: slot.saturating_sub(now),
            previous_slot,
            previous_burst,
        }
    }

    /// The caller is sending at `sent_at`; later callers space from there
    pub fn commit(&mut self, reservation: Reservation, sent_at: Duration) {
        self.total_requests += 1;
        if self.last_slot == Some(reservation.slot) && sent_at > reservation.slot {
            self.last_slot = Some(sent_at);
        }
    }

    /// The caller gave up before sending.
    ///
    /// The slot is handed back when nobody has queued behind it; otherwise
    /// the later caller keeps its place.
    pub fn release(&mut self, reservation: Reservation) {
        if self.last_slot == Some(reservation.slot) {
            self.last_slot = reservation.previous_slot;
            self.burst_count = reservation.previous_burst;
        }
    }

    /// Fold an attempt outcome into the delay.
    ///
    /// Every failure multiplies `current_delay`, capped at `max_delay`; the
    /// retry that follows is spaced by the delay in effect before it.
    /// `recovery_requests` consecutive successes divide it, floored at
    /// `base_delay`.
    pub fn record(&mut self, outcome: Outcome, limits: &RateLimits) {
        match outcome {
            Outcome::Success => {
                self.consecutive_errors = 0;
                self.consecutive_successes += 1;

                if self.consecutive_successes >= limits.recovery_requests {
                    self.consecutive_successes = 0;
                    self.current_delay =
                        scale(self.current_delay, 1.0 / limits.backoff_multiplier)
                            .max(limits.base_delay);
                }
                self.spacing = self.current_delay;
            }
            Outcome::Throttled | Outcome::ServerError => {
                self.consecutive_successes = 0;
                self.consecutive_errors += 1;
                self.total_failures += 1;

                self.spacing = self.current_delay;
                self.current_delay =
                    scale(self.current_delay, limits.backoff_multiplier).min(limits.max_delay);
            }
        }
    }
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}
