//! Health primitives shared by supervised components and the watchdog.
//!
//! Components publish a [`ComponentProbe`] snapshot; [`classify`] turns a
//! snapshot into a [`HealthStatus`]. Probes are cheap copies of
//! last-known state, so health checks never wait on pipeline transitions.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Computed health of one monitored component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Failed,
}

impl HealthStatus {
    /// Whether the watchdog should start a recovery for this status.
    pub fn needs_recovery(self) -> bool {
        matches!(self, Self::Unhealthy | Self::Failed)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
            Self::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Severity class of a pipeline error or warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bus warnings (late buffers, QoS, renegotiation).
    Warning,
    /// Errors the component retried or worked around locally.
    Recoverable,
    /// Errors that stopped the pipeline.
    Fatal,
}

/// Error counts within the recent window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub warning: u32,
    pub recoverable: u32,
    pub fatal: u32,
}

impl ErrorCounts {
    pub fn total(&self) -> u32 {
        self.warning + self.recoverable + self.fatal
    }
}

/// Sliding window of classified errors.
#[derive(Debug, Clone)]
pub struct ErrorWindow {
    window: Duration,
    entries: VecDeque<(Instant, ErrorClass)>,
    lifetime: ErrorCounts,
}

impl ErrorWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
            lifetime: ErrorCounts::default(),
        }
    }

    pub fn record(&mut self, class: ErrorClass) {
        self.record_at(Instant::now(), class);
    }

    pub fn record_at(&mut self, at: Instant, class: ErrorClass) {
        match class {
            ErrorClass::Warning => self.lifetime.warning += 1,
            ErrorClass::Recoverable => self.lifetime.recoverable += 1,
            ErrorClass::Fatal => self.lifetime.fatal += 1,
        }
        self.entries.push_back((at, class));
        self.prune(at);
    }

    /// Counts of errors recorded within the window ending at `now`.
    pub fn recent(&self, now: Instant) -> ErrorCounts {
        let mut counts = ErrorCounts::default();
        for (at, class) in &self.entries {
            if now.saturating_duration_since(*at) > self.window {
                continue;
            }
            match class {
                ErrorClass::Warning => counts.warning += 1,
                ErrorClass::Recoverable => counts.recoverable += 1,
                ErrorClass::Fatal => counts.fatal += 1,
            }
        }
        counts
    }

    /// Counts since creation, never pruned.
    pub fn lifetime(&self) -> ErrorCounts {
        self.lifetime
    }

    /// Drop the recent history (after a successful rebuild).
    pub fn clear_recent(&mut self) {
        self.entries.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.entries.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Last-known snapshot of a supervised component.
#[derive(Debug, Clone)]
pub struct ComponentProbe {
    /// Component name (`mixer`, `ingest:cam0`).
    pub name: String,
    /// State the component reports.
    pub reported_state: String,
    /// State the component should be in given operator intent and signal.
    pub expected_state: String,
    /// Whether buffers are expected to flow right now.
    pub expects_flow: bool,
    /// Component reports a fatal state (ERROR/FAILED).
    pub fatal: bool,
    /// Last buffer observed.
    pub last_activity: Option<Instant>,
    /// When the current pipeline instance was created; the staleness
    /// reference until the first buffer arrives.
    pub active_since: Option<Instant>,
    /// Errors within the recent window.
    pub recent_errors: ErrorCounts,
}

impl ComponentProbe {
    pub fn state_matches(&self) -> bool {
        self.reported_state == self.expected_state
    }

    /// JSON snapshot for diagnostic logs.
    pub fn diagnostics(&self, now: Instant) -> serde_json::Value {
        let age_ms = |at: Option<Instant>| at.map(|t| now.saturating_duration_since(t).as_millis() as u64);
        serde_json::json!({
            "name": self.name,
            "observed_at": crate::clock::wall_clock_now(),
            "reported_state": self.reported_state,
            "expected_state": self.expected_state,
            "expects_flow": self.expects_flow,
            "fatal": self.fatal,
            "last_activity_age_ms": age_ms(self.last_activity),
            "active_since_age_ms": age_ms(self.active_since),
            "recent_errors": self.recent_errors,
        })
    }
}

/// Thresholds used by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// No buffer for longer than this means UNHEALTHY.
    pub stale_after: Duration,
    /// This many errors within the window means UNHEALTHY.
    pub persistent_errors: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(10),
            persistent_errors: 5,
        }
    }
}

/// Classify a probe.
///
/// - FAILED: the component reports a fatal state.
/// - UNHEALTHY: buffers expected but none within `stale_after`, or at
///   least `persistent_errors` errors in the window.
/// - DEGRADED: state mismatch or some recent errors.
/// - HEALTHY: otherwise.
pub fn classify(probe: &ComponentProbe, thresholds: &HealthThresholds, now: Instant) -> HealthStatus {
    if probe.fatal {
        return HealthStatus::Failed;
    }

    if probe.expects_flow {
        let reference = probe.last_activity.or(probe.active_since);
        let stale = match reference {
            Some(at) => now.saturating_duration_since(at) > thresholds.stale_after,
            None => true,
        };
        if stale {
            return HealthStatus::Unhealthy;
        }
    }

    let errors = probe.recent_errors.total();
    if thresholds.persistent_errors > 0 && errors >= thresholds.persistent_errors {
        return HealthStatus::Unhealthy;
    }

    if !probe.state_matches() || errors > 0 {
        return HealthStatus::Degraded;
    }

    HealthStatus::Healthy
}
