//! [`Clock`] – injectable time source.
//!
//! Everything in the bridge that reads the time or waits goes through a
//! `Clock`, so tests can drive time explicitly with [`ManualClock`] instead
//! of sleeping.
//!
//! | Clock | Behaviour |
//! |---|---|
//! | [`SystemClock`] | Wall clock plus an offset learned during the bridge handshake. |
//! | [`ManualClock`] | Stands still until [`ManualClock::advance`] is called. |
//! | [`ReplayClock`] | Starts at a given instant and runs `speed` times faster than real time. |

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Source of the current time and of (abortable) waits.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time according to this clock.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend for `duration` as measured by this clock.
    async fn sleep(&self, duration: Duration);

    /// Suspend for `duration` or until `abort` fires, whichever is first.
    ///
    /// Returns `true` when the wait ended because of `abort`.
    async fn wait(&self, duration: Duration, abort: &CancellationToken) -> bool {
        if abort.is_cancelled() {
            return true;
        }
        tokio::select! {
            biased;
            _ = abort.cancelled() => true,
            _ = self.sleep(duration) => false,
        }
    }

    /// Re-align this clock so that [`now`](Clock::now) reads `reference`.
    fn adjust(&self, reference: DateTime<Utc>);
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// SystemClock
// ─────────────────────────────────────────────────────────────────────────────

/// Wall clock with an adjustable offset.
///
/// [`Clock::adjust`] records the difference between the reference and the
/// local wall clock instead of touching the operating-system time.
#[derive(Debug, Default)]
pub struct SystemClock {
    offset_micros: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset currently applied on top of the wall clock.
    pub fn offset(&self) -> TimeDelta {
        TimeDelta::microseconds(self.offset_micros.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn adjust(&self, reference: DateTime<Utc>) {
        let offset = (reference - Utc::now()).num_microseconds().unwrap_or(0);
        self.offset_micros.store(offset, Ordering::Relaxed);
        info!(offset_us = offset, "system clock offset adjusted");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ManualClock
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic clock for tests: time only moves when told to.
///
/// Sleepers wake as soon as [`advance`](ManualClock::advance) or
/// [`set`](ManualClock::set) moves the time past their deadline.
#[derive(Debug)]
pub struct ManualClock {
    now: watch::Sender<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        let (now, _) = watch::channel(start);
        Self { now }
    }

    /// Move time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let delta = to_delta(duration);
        self.now.send_modify(|now| {
            if let Some(next) = now.checked_add_signed(delta) {
                *now = next;
            }
        });
    }

    /// Jump to `at` (backwards jumps are allowed).
    pub fn set(&self, at: DateTime<Utc>) {
        self.now.send_replace(at);
    }

    /// Number of tasks currently sleeping on this clock.
    pub fn sleepers(&self) -> usize {
        self.now.receiver_count()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::UNIX_EPOCH)
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.borrow()
    }

    async fn sleep(&self, duration: Duration) {
        let Some(deadline) = self.now().checked_add_signed(to_delta(duration)) else {
            return std::future::pending().await;
        };
        let mut rx = self.now.subscribe();
        let _ = rx.wait_for(|now| *now >= deadline).await;
    }

    fn adjust(&self, reference: DateTime<Utc>) {
        self.set(reference);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ReplayClock
// ─────────────────────────────────────────────────────────────────────────────

/// Clock for replaying recorded sessions: starts at `start` and runs
/// `speed` times faster than real time.
#[derive(Debug)]
pub struct ReplayClock {
    anchor: Mutex<(DateTime<Utc>, Instant)>,
    speed: f64,
}

impl ReplayClock {
    /// `speed` must be positive; non-positive values are treated as `1.0`.
    pub fn new(start: DateTime<Utc>, speed: f64) -> Self {
        let speed = if speed > 0.0 && speed.is_finite() { speed } else { 1.0 };
        Self {
            anchor: Mutex::new((start, Instant::now())),
            speed,
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }
}

#[async_trait]
impl Clock for ReplayClock {
    fn now(&self) -> DateTime<Utc> {
        let (start, origin) = *self.anchor.lock().unwrap_or_else(|e| e.into_inner());
        let scaled = origin.elapsed().mul_f64(self.speed);
        start.checked_add_signed(to_delta(scaled)).unwrap_or(start)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration.div_f64(self.speed)).await;
    }

    fn adjust(&self, reference: DateTime<Utc>) {
        *self.anchor.lock().unwrap_or_else(|e| e.into_inner()) = (reference, Instant::now());
    }
}
