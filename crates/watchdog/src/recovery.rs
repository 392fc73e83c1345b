//! Recovery phase machine for one component.

use std::fmt;
use std::time::Duration;

use scenemix_common::config::WatchdogSettings;
use scenemix_common::health::{classify, HealthStatus, HealthThresholds};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::supervised::Supervised;

/// Phase of a running recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPhase {
    Detecting,
    Draining,
    Released,
    Rebuilding,
    Verifying,
    Healthy,
    Failed,
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Detecting => "DETECTING",
            Self::Draining => "DRAINING",
            Self::Released => "RELEASED",
            Self::Rebuilding => "REBUILDING",
            Self::Verifying => "VERIFYING",
            Self::Healthy => "HEALTHY",
            Self::Failed => "FAILED",
        })
    }
}

/// How a recovery ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Rebuilt and verified healthy.
    Recovered,
    /// The component was healthy again before anything was touched.
    AlreadyHealthy,
    Failed(String),
    /// The watchdog shut down mid-recovery.
    Cancelled,
}

/// One recovery attempt, advanced phase by phase.
pub struct Recovery<'a> {
    component: &'a dyn Supervised,
    settings: &'a WatchdogSettings,
    thresholds: HealthThresholds,
    shutdown: watch::Receiver<bool>,
    phase: RecoveryPhase,
    failure: Option<String>,
}

impl<'a> Recovery<'a> {
    pub fn new(
        component: &'a dyn Supervised,
        settings: &'a WatchdogSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            component,
            settings,
            thresholds: settings.thresholds(),
            shutdown,
            phase: RecoveryPhase::Detecting,
            failure: None,
        }
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Run to a terminal phase. `on_phase` sees every phase entered.
    pub async fn run(mut self, on_phase: impl Fn(RecoveryPhase)) -> RecoveryOutcome {
        let name = self.component.name();
        loop {
            on_phase(self.phase);
            let next = match self.phase {
                RecoveryPhase::Detecting => match self.detect() {
                    Some(next) => next,
                    None => return RecoveryOutcome::AlreadyHealthy,
                },
                RecoveryPhase::Draining => self.drain().await,
                RecoveryPhase::Released => {
                    tracing::debug!(component = %name, delay = ?self.settings.settle_delay(), "Waiting for device release");
                    if !self.sleep(self.settings.settle_delay()).await {
                        return RecoveryOutcome::Cancelled;
                    }
                    RecoveryPhase::Rebuilding
                }
                RecoveryPhase::Rebuilding => {
                    let limit = self.settings.step_timeout();
                    match tokio::time::timeout(limit, self.component.rebuild()).await {
                        Ok(Ok(())) => RecoveryPhase::Verifying,
                        Ok(Err(e)) => self.fail(format!("rebuild failed: {e}")),
                        Err(_) => self.fail(format!("rebuild did not finish within {limit:?}")),
                    }
                }
                RecoveryPhase::Verifying => match self.verify().await {
                    Some(next) => next,
                    None => return RecoveryOutcome::Cancelled,
                },
                RecoveryPhase::Healthy => return RecoveryOutcome::Recovered,
                RecoveryPhase::Failed => {
                    return RecoveryOutcome::Failed(
                        self.failure.take().unwrap_or_else(|| "recovery failed".to_string()),
                    )
                }
            };
            tracing::debug!(component = %name, from = %self.phase, to = %next, "Recovery phase");
            self.phase = next;
        }
    }

    fn detect(&mut self) -> Option<RecoveryPhase> {
        let now = Instant::now();
        let status = match self.component.probe() {
            Ok(probe) => classify(&probe, &self.thresholds, now),
            Err(e) => return Some(self.fail(format!("probe failed: {e}"))),
        };
        if !status.needs_recovery() {
            tracing::info!(component = %self.component.name(), %status, "Component recovered on its own; nothing to do");
            return None;
        }
        tracing::warn!(
            component = %self.component.name(),
            %status,
            diagnostics = %self.component.diagnostics(now),
            "Starting recovery"
        );
        Some(RecoveryPhase::Draining)
    }

    /// Drain, then force a stop. Together bounded by the drain timeout
    /// plus one step timeout.
    async fn drain(&mut self) -> RecoveryPhase {
        let name = self.component.name();
        let drain_timeout = self.settings.drain_timeout();
        match tokio::time::timeout(drain_timeout, self.component.drain(drain_timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(component = %name, error = %e, "Drain did not complete; forcing stop");
            }
            Err(_) => {
                tracing::warn!(component = %name, timeout = ?drain_timeout, "Drain overran its timeout; forcing stop");
            }
        }
        let limit = self.settings.step_timeout();
        match tokio::time::timeout(limit, self.component.force_stop()).await {
            Ok(Ok(())) => RecoveryPhase::Released,
            Ok(Err(e)) => self.fail(format!("forced stop failed: {e}")),
            Err(_) => self.fail(format!("forced stop did not finish within {limit:?}")),
        }
    }

    /// Poll until the component classifies HEALTHY or the window closes.
    /// `None` when cancelled.
    async fn verify(&mut self) -> Option<RecoveryPhase> {
        let deadline = Instant::now() + self.settings.verify_window();
        let mut last = None;
        loop {
            let now = Instant::now();
            match self.component.probe() {
                Ok(probe) => {
                    let status = classify(&probe, &self.thresholds, now);
                    if status == HealthStatus::Healthy {
                        return Some(RecoveryPhase::Healthy);
                    }
                    last = Some(status);
                }
                Err(e) => return Some(self.fail(format!("probe failed: {e}"))),
            }
            if now >= deadline {
                let status = last.map(|s| s.to_string()).unwrap_or_default();
                return Some(self.fail(format!(
                    "not healthy within {:?} (last {status})",
                    self.settings.verify_window()
                )));
            }
            let pause = self
                .settings
                .verify_poll()
                .min(deadline.saturating_duration_since(now));
            if !self.sleep(pause).await {
                return None;
            }
        }
    }

    fn fail(&mut self, reason: String) -> RecoveryPhase {
        self.failure = Some(reason);
        RecoveryPhase::Failed
    }

    /// Sleep unless the watchdog shuts down first; `false` on shutdown.
    async fn sleep(&mut self, duration: Duration) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.changed() => false,
        }
    }
}
