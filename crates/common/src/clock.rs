//! Timing utilities for liveness tracking and retry pacing.
//!
//! All instants are `tokio::time::Instant` so that timer-driven behaviour
//! (staleness, backoff, settle delays) follows tokio's clock, which tests
//! can pause and advance deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Lock-free "last buffer seen" timestamp.
///
/// Written from streaming threads (buffer probes), read by health checks.
/// Stored as nanoseconds since the stamp's own epoch, offset by one so that
/// zero means "never touched".
#[derive(Debug)]
pub struct ActivityStamp {
    epoch: Instant,
    last_ns: AtomicU64,
}

impl ActivityStamp {
    /// Create a stamp that has never observed activity.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ns: AtomicU64::new(0),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Record activity at a specific instant. Instants before the epoch
    /// are recorded as the epoch itself.
    pub fn touch_at(&self, at: Instant) {
        let ns = at.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.last_ns.fetch_max(ns.saturating_add(1), Ordering::Relaxed);
    }

    /// Last recorded activity, if any.
    pub fn last(&self) -> Option<Instant> {
        match self.last_ns.load(Ordering::Relaxed) {
            0 => None,
            n => Some(self.epoch + Duration::from_nanos(n - 1)),
        }
    }

    /// Forget all recorded activity.
    pub fn clear(&self) {
        self.last_ns.store(0, Ordering::Relaxed);
    }
}

impl Default for ActivityStamp {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff with a ceiling and an attempt cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    cap: u32,
    attempt: u32,
}

impl Backoff {
    /// `cap` is the number of retries allowed before [`Backoff::next_delay`]
    /// returns `None`.
    pub fn new(base: Duration, max: Duration, cap: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            cap,
            attempt: 0,
        }
    }

    /// Delay before the next retry, or `None` once the cap is exceeded.
    /// The first delay equals `base`; each subsequent one doubles.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.cap {
            return None;
        }
        let delay = Self::delay_for(self.base, self.max, self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Delay for a given zero-based attempt number.
    pub fn delay_for(base: Duration, max: Duration, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(max.max(base))
    }

    /// Retries consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Whether no retries remain.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.cap
    }

    /// Start over (after a success or an operator reset).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Wall-clock timestamp for diagnostics (RFC 3339).
pub fn wall_clock_now() -> String {
    chrono::Utc::now().to_rfc3339()
}
