//! Periodic health assessment and recovery scheduling.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use scenemix_common::clock::Backoff;
use scenemix_common::config::WatchdogSettings;
use scenemix_common::error::{ScenemixError, ScenemixResult};
use scenemix_common::health::{classify, HealthStatus, HealthThresholds};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::recovery::{Recovery, RecoveryOutcome, RecoveryPhase};
use crate::supervised::Supervised;

/// Recovery bookkeeping for one component.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStatus {
    pub component: String,
    pub health: HealthStatus,
    /// Phase of the running or last recovery.
    pub phase: Option<RecoveryPhase>,
    /// Consecutive failed recoveries.
    pub failed_attempts: u32,
    pub recoveries: u32,
    /// Retry cap reached; stays FAILED until [`Watchdog::reset`].
    pub exhausted: bool,
    pub last_outcome: Option<RecoveryOutcome>,
    #[serde(skip)]
    pub next_allowed: Option<Instant>,
}

struct Entry {
    component: Arc<dyn Supervised>,
    status: RecoveryStatus,
    running: bool,
}

struct Inner {
    settings: WatchdogSettings,
    thresholds: HealthThresholds,
    entries: Mutex<BTreeMap<String, Entry>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Supervises components and recovers the ones that go bad.
///
/// Cloning yields another handle to the same watchdog.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    pub fn new(components: Vec<Arc<dyn Supervised>>, settings: WatchdogSettings) -> Self {
        let entries = components
            .into_iter()
            .map(|component| {
                let name = component.name();
                let status = RecoveryStatus {
                    component: name.clone(),
                    health: HealthStatus::Healthy,
                    phase: None,
                    failed_attempts: 0,
                    recoveries: 0,
                    exhausted: false,
                    last_outcome: None,
                    next_allowed: None,
                };
                (
                    name,
                    Entry {
                        component,
                        status,
                        running: false,
                    },
                )
            })
            .collect();
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                thresholds: settings.thresholds(),
                settings,
                entries: Mutex::new(entries),
                tasks: Mutex::new(Vec::new()),
                shutdown,
            }),
        }
    }

    /// Classify every component and start recovery for those that need
    /// it. Only reads snapshots; recoveries run on their own tasks.
    pub fn tick(&self) -> BTreeMap<String, HealthStatus> {
        let now = Instant::now();
        let mut to_recover = Vec::new();
        let mut health = BTreeMap::new();

        {
            let mut entries = self.inner.entries();
            for (name, entry) in entries.iter_mut() {
                let status = if entry.status.exhausted {
                    HealthStatus::Failed
                } else {
                    match entry.component.probe() {
                        Ok(probe) => classify(&probe, &self.inner.thresholds, now),
                        Err(e) => {
                            tracing::warn!(component = %name, error = %e, "Health probe failed");
                            HealthStatus::Failed
                        }
                    }
                };
                if status != entry.status.health {
                    tracing::info!(component = %name, from = %entry.status.health, to = %status, "Health changed");
                }
                entry.status.health = status;
                health.insert(name.clone(), status);

                let allowed = entry.status.next_allowed.map_or(true, |at| now >= at);
                if status.needs_recovery() && !entry.status.exhausted && !entry.running && allowed {
                    entry.running = true;
                    entry.status.phase = Some(RecoveryPhase::Detecting);
                    to_recover.push(Arc::clone(&entry.component));
                }
            }
        }

        for component in to_recover {
            self.spawn_recovery(component);
        }
        health
    }

    fn spawn_recovery(&self, component: Arc<dyn Supervised>) {
        let watchdog = self.clone();
        let task = tokio::spawn(async move {
            let name = component.name();
            let settings = watchdog.inner.settings.clone();
            let recovery = Recovery::new(component.as_ref(), &settings, watchdog.inner.shutdown.subscribe());
            let outcome = recovery
                .run(|phase| watchdog.with_entry(&name, |entry| entry.status.phase = Some(phase)))
                .await;
            watchdog.finish(&name, outcome);
        });
        let mut tasks = self.inner.tasks();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn finish(&self, name: &str, outcome: RecoveryOutcome) {
        let settings = &self.inner.settings;
        let now = Instant::now();
        self.with_entry(name, |entry| {
            entry.running = false;
            let status = &mut entry.status;
            match &outcome {
                RecoveryOutcome::Recovered => {
                    status.recoveries += 1;
                    status.failed_attempts = 0;
                    status.health = HealthStatus::Healthy;
                    status.next_allowed = Some(now + settings.cooldown());
                    tracing::info!(component = %name, recoveries = status.recoveries, "Recovery complete");
                }
                RecoveryOutcome::AlreadyHealthy | RecoveryOutcome::Cancelled => {
                    status.phase = None;
                }
                RecoveryOutcome::Failed(reason) => {
                    status.failed_attempts += 1;
                    status.phase = Some(RecoveryPhase::Failed);
                    if status.failed_attempts >= settings.max_recovery_attempts {
                        status.exhausted = true;
                        status.health = HealthStatus::Failed;
                        status.next_allowed = None;
                        let err = ScenemixError::RecoveryExhausted {
                            component: name.to_string(),
                            attempts: status.failed_attempts,
                        };
                        tracing::error!(component = %name, error = %err, %reason, "Giving up; manual reset required");
                    } else {
                        let delay = Backoff::delay_for(
                            settings.recovery_backoff_base(),
                            settings.recovery_backoff_max(),
                            status.failed_attempts - 1,
                        );
                        status.next_allowed = Some(now + delay);
                        tracing::warn!(
                            component = %name,
                            %reason,
                            attempt = status.failed_attempts,
                            retry_in = ?delay,
                            "Recovery failed"
                        );
                    }
                }
            }
            status.last_outcome = Some(outcome.clone());
        });
    }

    fn with_entry(&self, name: &str, f: impl FnOnce(&mut Entry)) {
        if let Some(entry) = self.inner.entries().get_mut(name) {
            f(entry);
        }
    }

    /// Last computed health per component.
    pub fn health(&self) -> BTreeMap<String, HealthStatus> {
        self.inner
            .entries()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status.health))
            .collect()
    }

    pub fn recovery_status(&self, name: &str) -> Option<RecoveryStatus> {
        self.inner.entries().get(name).map(|e| e.status.clone())
    }

    pub fn recovery_statuses(&self) -> Vec<RecoveryStatus> {
        self.inner
            .entries()
            .values()
            .map(|e| e.status.clone())
            .collect()
    }

    /// Clear a permanent FAILED so recovery may run again.
    pub fn reset(&self, name: &str) -> ScenemixResult<()> {
        let mut entries = self.inner.entries();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| ScenemixError::not_found("component", name))?;
        entry.status.exhausted = false;
        entry.status.failed_attempts = 0;
        entry.status.next_allowed = None;
        entry.status.phase = None;
        tracing::info!(component = %name, "Recovery state reset");
        Ok(())
    }

    /// Wait for every running recovery to finish.
    pub async fn settle(&self) {
        loop {
            let tasks: Vec<JoinHandle<()>> = self.inner.tasks().drain(..).collect();
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "Recovery task panicked");
                }
            }
        }
    }

    /// Tick every `interval` until [`Watchdog::shutdown`].
    pub fn spawn(&self) -> JoinHandle<()> {
        let watchdog = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let interval = self.inner.settings.interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(?interval, "Watchdog running");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        watchdog.tick();
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Watchdog loop stopped");
        })
    }

    /// Stop ticking, cancel recovery timers, and wait for running
    /// recoveries to wind down.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.settle().await;
    }

    pub fn interval(&self) -> Duration {
        self.inner.settings.interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use scenemix_common::health::{ComponentProbe, ErrorCounts};

    /// Scripted component: flowing or stalled, with rebuilds that succeed,
    /// fail or never return on demand.
    struct Scripted {
        stalled_at: Mutex<Option<Instant>>,
        rebuild_ok: AtomicBool,
        hang_rebuild: AtomicBool,
        hang_stop: AtomicBool,
        rebuilds: AtomicU32,
        force_stops: AtomicU32,
    }

    impl Scripted {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                stalled_at: Mutex::new(None),
                rebuild_ok: AtomicBool::new(true),
                hang_rebuild: AtomicBool::new(false),
                hang_stop: AtomicBool::new(false),
                rebuilds: AtomicU32::new(0),
                force_stops: AtomicU32::new(0),
            })
        }

        fn stall(&self) {
            *self.stalled_at.lock().unwrap() = Some(Instant::now());
        }

        fn resume(&self) {
            *self.stalled_at.lock().unwrap() = None;
        }
    }

    #[async_trait]
    impl Supervised for Scripted {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        fn probe(&self) -> ScenemixResult<ComponentProbe> {
            let last_activity = self.stalled_at.lock().unwrap().unwrap_or_else(Instant::now);
            Ok(ComponentProbe {
                name: self.name(),
                reported_state: "PLAYING".to_string(),
                expected_state: "PLAYING".to_string(),
                expects_flow: true,
                fatal: false,
                last_activity: Some(last_activity),
                active_since: None,
                recent_errors: ErrorCounts::default(),
            })
        }

        async fn drain(&self, timeout: Duration) -> ScenemixResult<()> {
            tokio::time::sleep(timeout).await;
            Err(ScenemixError::transition_timeout("scripted", "EOS", timeout))
        }

        async fn force_stop(&self) -> ScenemixResult<()> {
            self.force_stops.fetch_add(1, Ordering::SeqCst);
            if self.hang_stop.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn rebuild(&self) -> ScenemixResult<()> {
            self.rebuilds.fetch_add(1, Ordering::SeqCst);
            if self.hang_rebuild.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.rebuild_ok.load(Ordering::SeqCst) {
                self.resume();
                Ok(())
            } else {
                Err(ScenemixError::pipeline_build("scripted failure"))
            }
        }
    }

    fn settings() -> WatchdogSettings {
        WatchdogSettings {
            max_recovery_attempts: 3,
            ..WatchdogSettings::default()
        }
    }

    fn watchdog(component: &Arc<Scripted>) -> Watchdog {
        let supervised: Arc<dyn Supervised> = component.clone();
        Watchdog::new(vec![supervised], settings())
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_component_is_left_alone() {
        let component = Scripted::new();
        let watchdog = watchdog(&component);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(watchdog.tick()["scripted"], HealthStatus::Healthy);
        watchdog.settle().await;
        assert_eq!(component.rebuilds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_component_is_drained_released_rebuilt_and_verified() {
        let component = Scripted::new();
        let watchdog = watchdog(&component);
        component.stall();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(watchdog.tick()["scripted"], HealthStatus::Healthy);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(watchdog.tick()["scripted"], HealthStatus::Unhealthy);
        watchdog.settle().await;

        let status = watchdog.recovery_status("scripted").unwrap();
        assert_eq!(status.last_outcome, Some(RecoveryOutcome::Recovered));
        assert_eq!(status.phase, Some(RecoveryPhase::Healthy));
        assert_eq!(component.force_stops.load(Ordering::SeqCst), 1);
        assert_eq!(component.rebuilds.load(Ordering::SeqCst), 1);
        assert_eq!(watchdog.tick()["scripted"], HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn self_healed_component_is_not_touched() {
        let component = Scripted::new();
        let watchdog = watchdog(&component);
        component.stall();
        tokio::time::sleep(Duration::from_secs(11)).await;

        // Unhealthy at tick time, flowing again by the time recovery looks.
        assert_eq!(watchdog.tick()["scripted"], HealthStatus::Unhealthy);
        component.resume();
        watchdog.settle().await;

        let status = watchdog.recovery_status("scripted").unwrap();
        assert_eq!(status.last_outcome, Some(RecoveryOutcome::AlreadyHealthy));
        assert_eq!(component.force_stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_spaces_out_recoveries() {
        let component = Scripted::new();
        let watchdog = watchdog(&component);
        component.stall();
        tokio::time::sleep(Duration::from_secs(11)).await;
        watchdog.tick();
        watchdog.settle().await;
        assert_eq!(component.rebuilds.load(Ordering::SeqCst), 1);

        component.stall();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(watchdog.tick()["scripted"], HealthStatus::Unhealthy);
        watchdog.settle().await;
        assert_eq!(component.rebuilds.load(Ordering::SeqCst), 1, "inside cooldown");

        tokio::time::sleep(settings().cooldown()).await;
        watchdog.tick();
        watchdog.settle().await;
        assert_eq!(component.rebuilds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_back_off_then_stay_failed_until_reset() {
        let component = Scripted::new();
        component.rebuild_ok.store(false, Ordering::SeqCst);
        let watchdog = watchdog(&component);
        component.stall();
        tokio::time::sleep(Duration::from_secs(11)).await;

        let mut gaps = Vec::new();
        let mut last_attempt = None;
        for _ in 0..200 {
            let before = component.rebuilds.load(Ordering::SeqCst);
            watchdog.tick();
            watchdog.settle().await;
            if component.rebuilds.load(Ordering::SeqCst) > before {
                let now = Instant::now();
                if let Some(prev) = last_attempt {
                    gaps.push(now - prev);
                }
                last_attempt = Some(now);
            }
            if watchdog.recovery_status("scripted").unwrap().exhausted {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let status = watchdog.recovery_status("scripted").unwrap();
        assert!(status.exhausted);
        assert_eq!(status.failed_attempts, 3);
        assert_eq!(component.rebuilds.load(Ordering::SeqCst), 3);
        assert_eq!(gaps.len(), 2);
        assert!(gaps[1] > gaps[0], "backoff grows: {gaps:?}");

        // Permanently FAILED: no more attempts even much later.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(watchdog.tick()["scripted"], HealthStatus::Failed);
        watchdog.settle().await;
        assert_eq!(component.rebuilds.load(Ordering::SeqCst), 3);

        component.rebuild_ok.store(true, Ordering::SeqCst);
        watchdog.reset("scripted").unwrap();
        watchdog.tick();
        watchdog.settle().await;
        assert_eq!(
            watchdog.recovery_status("scripted").unwrap().last_outcome,
            Some(RecoveryOutcome::Recovered)
        );
        assert!(watchdog.reset("nope").is_err());
    }

    fn failure_reason(watchdog: &Watchdog) -> String {
        match watchdog.recovery_status("scripted").unwrap().last_outcome {
            Some(RecoveryOutcome::Failed(reason)) => reason,
            other => panic!("expected a failed recovery, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_rebuild_fails_within_the_step_timeout() {
        let component = Scripted::new();
        component.hang_rebuild.store(true, Ordering::SeqCst);
        let watchdog = watchdog(&component);
        component.stall();
        tokio::time::sleep(Duration::from_secs(11)).await;

        let started = Instant::now();
        watchdog.tick();
        watchdog.settle().await;

        let s = settings();
        assert_eq!(
            started.elapsed(),
            s.drain_timeout() + s.settle_delay() + s.step_timeout()
        );
        let status = watchdog.recovery_status("scripted").unwrap();
        assert_eq!(status.phase, Some(RecoveryPhase::Failed));
        assert_eq!(status.failed_attempts, 1);
        assert!(failure_reason(&watchdog).contains("rebuild did not finish"));

        // The slot is free again: a later tick can schedule the next attempt.
        component.hang_rebuild.store(false, Ordering::SeqCst);
        tokio::time::sleep(s.recovery_backoff_max()).await;
        watchdog.tick();
        watchdog.settle().await;
        assert_eq!(
            watchdog.recovery_status("scripted").unwrap().last_outcome,
            Some(RecoveryOutcome::Recovered)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_forced_stop_fails_without_rebuilding() {
        let component = Scripted::new();
        component.hang_stop.store(true, Ordering::SeqCst);
        let watchdog = watchdog(&component);
        component.stall();
        tokio::time::sleep(Duration::from_secs(11)).await;

        let started = Instant::now();
        watchdog.tick();
        watchdog.settle().await;

        let s = settings();
        assert_eq!(started.elapsed(), s.drain_timeout() + s.step_timeout());
        assert!(failure_reason(&watchdog).contains("forced stop did not finish"));
        assert_eq!(component.force_stops.load(Ordering::SeqCst), 1);
        assert_eq!(component.rebuilds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_a_recovery_in_its_settle_delay() {
        let component = Scripted::new();
        let watchdog = watchdog(&component);
        component.stall();
        tokio::time::sleep(Duration::from_secs(11)).await;
        watchdog.tick();

        // Past the drain timeout, inside the settle delay.
        tokio::time::sleep(settings().drain_timeout() + Duration::from_millis(500)).await;
        assert_eq!(
            watchdog.recovery_status("scripted").unwrap().phase,
            Some(RecoveryPhase::Released)
        );
        watchdog.shutdown().await;
        assert_eq!(component.rebuilds.load(Ordering::SeqCst), 0);
        assert_eq!(
            watchdog.recovery_status("scripted").unwrap().last_outcome,
            Some(RecoveryOutcome::Cancelled)
        );
    }
}
