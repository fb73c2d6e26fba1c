//! Time Source
//!
//! Wall-clock timestamps (cache expiry) and a monotonic timeline (limiter
//! slots) behind one injectable trait, so the limiter and the cache can be
//! driven by a virtual clock in tests.

use std::fmt::Debug;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Injectable time source
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic time since the clock was created
    fn monotonic(&self) -> Duration;

    /// Suspend the caller for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by `Utc::now`, `Instant` and `tokio::time::sleep`
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock for tests.
///
/// Time only moves when `advance` is called or when someone sleeps; a sleep
/// advances the clock by exactly the requested duration and is recorded.
#[derive(Debug)]
pub struct ManualClock {
    start: DateTime<Utc>,
    inner: Mutex<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    offset: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Create a virtual clock starting at the current wall-clock time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a virtual clock starting at `start`
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            start,
            inner: Mutex::new(ManualState::default()),
        }
    }

    /// Move time forward without recording a sleep
    pub fn advance(&self, by: Duration) {
        self.inner.lock().offset += by;
    }

    /// Every sleep requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.lock().sleeps.clone()
    }

    /// Sum of all recorded sleeps
    pub fn total_slept(&self) -> Duration {
        self.inner.lock().sleeps.iter().sum()
    }

    /// Forget recorded sleeps (time is left where it is)
    pub fn clear_sleeps(&self) {
        self.inner.lock().sleeps.clear();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let offset = self.inner.lock().offset;
        match chrono::Duration::from_std(offset) {
            Ok(offset) => self.start + offset,
            Err(_) => DateTime::<Utc>::MAX_UTC,
        }
    }

    fn monotonic(&self) -> Duration {
        self.inner.lock().offset
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut inner = self.inner.lock();
            inner.offset += duration;
            inner.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}
