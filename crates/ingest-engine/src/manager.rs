//! Per-camera ingest coordination.
//!
//! Every camera has a coordinator task that owns its pipeline and device
//! lease. Control operations are commands on that task's channel, so they
//! are serialized per camera and a slow or failing camera never blocks
//! another. Status reads come from a shared snapshot and never wait on a
//! pipeline transition.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;

use scenemix_common::clock::Backoff;
use scenemix_common::config::{CameraConfig, IngestSettings};
use scenemix_common::error::{ScenemixError, ScenemixResult};
use scenemix_common::health::{ComponentProbe, ErrorClass, ErrorWindow};
use scenemix_media_graph::backend::{BusSeverity, MediaPipeline, PipelineBackend, PipelineState};
use scenemix_media_graph::relay::{MediaRelay, StreamHandle};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::device::{DeviceLease, DeviceRegistry};
use crate::pipeline::{ingest_graph, stream_handle};
use crate::signal::{FrameSize, SignalEvent, SignalReading, SignalState};

/// Lifecycle state of one ingest pipeline.
///
/// A start that fails transiently, including one that does not reach
/// PLAYING within `start_timeout`, releases the device and returns to
/// `Idle` with a retry scheduled on backoff. `Error` is entered only once
/// the failed starts exceed `retry_cap`, or on a failure no retry can fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestState {
    Idle,
    Starting,
    Streaming,
    Stopping,
    Error,
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "IDLE",
            Self::Starting => "STARTING",
            Self::Streaming => "STREAMING",
            Self::Stopping => "STOPPING",
            Self::Error => "ERROR",
        })
    }
}

/// Best-effort status of one camera.
#[derive(Debug, Clone, Serialize)]
pub struct IngestStatus {
    pub camera_id: String,
    pub enabled: bool,
    pub state: IngestState,
    pub signal: SignalState,
    pub has_signal: bool,
    pub resolution: Option<FrameSize>,
    /// Published stream, while STREAMING.
    pub stream_handle: Option<StreamHandle>,
    /// Consecutive failed start attempts.
    pub retries: u32,
    pub last_error: Option<String>,
}

/// Health component name for a camera.
pub fn component_name(camera_id: &str) -> String {
    format!("ingest:{camera_id}")
}

struct Snapshot {
    state: IngestState,
    reading: SignalReading,
    /// Operator intent: the camera should stream whenever it has signal.
    wanted: bool,
    retry_pending: bool,
    retries: u32,
    last_error: Option<String>,
    pipeline: Option<Arc<dyn MediaPipeline>>,
    active_since: Option<Instant>,
    errors: ErrorWindow,
}

struct CameraShared {
    config: CameraConfig,
    snapshot: RwLock<Snapshot>,
}

impl CameraShared {
    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut snapshot);
    }

    fn expected_state(&self, s: &Snapshot) -> IngestState {
        if self.config.enabled && s.wanted && s.reading.present && !s.retry_pending {
            IngestState::Streaming
        } else {
            IngestState::Idle
        }
    }

    fn status(&self) -> IngestStatus {
        let s = self.read();
        let signal = match s.state {
            IngestState::Error => SignalState::Error,
            IngestState::Streaming => SignalState::Streaming,
            _ if s.reading.present => SignalState::SignalDetected,
            _ => SignalState::NoSignal,
        };
        IngestStatus {
            camera_id: self.config.id.clone(),
            enabled: self.config.enabled,
            state: s.state,
            signal,
            has_signal: s.reading.present,
            resolution: s.reading.size(),
            stream_handle: (s.state == IngestState::Streaming).then(|| stream_handle(&self.config.id)),
            retries: s.retries,
            last_error: s.last_error.clone(),
        }
    }

    fn probe(&self, now: Instant) -> ComponentProbe {
        let s = self.read();
        let expected = self.expected_state(&s);
        ComponentProbe {
            name: component_name(&self.config.id),
            reported_state: s.state.to_string(),
            expected_state: expected.to_string(),
            expects_flow: expected == IngestState::Streaming,
            fatal: s.state == IngestState::Error,
            last_activity: s.pipeline.as_ref().and_then(|p| p.last_activity()),
            active_since: s.active_since,
            recent_errors: s.errors.recent(now),
        }
    }
}

type Reply = oneshot::Sender<ScenemixResult<()>>;

enum Command {
    Start(Reply),
    Stop(Reply),
    Signal(SignalReading, Reply),
    Restart(Reply),
    Drain(Duration, Reply),
    ForceStop(Reply),
    Shutdown(oneshot::Sender<()>),
}

struct ActivePipeline {
    pipeline: Arc<dyn MediaPipeline>,
    // Dropped after the pipeline handle.
    _lease: DeviceLease,
}

/// Coordinator task state for one camera.
struct CameraWorker {
    shared: Arc<CameraShared>,
    settings: IngestSettings,
    backend: Arc<dyn PipelineBackend>,
    relay: Arc<dyn MediaRelay>,
    devices: DeviceRegistry,
    active: Option<ActivePipeline>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl CameraWorker {
    fn id(&self) -> &str {
        &self.shared.config.id
    }

    fn should_run(&self) -> bool {
        self.shared.config.enabled && self.shared.read().wanted
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut bus_tick = tokio::time::interval(self.settings.bus_poll());
        bus_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let retry_at = self.retry_at;
            let retry = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if self.handle(command).await.is_break() {
                        break;
                    }
                }
                _ = bus_tick.tick() => self.poll_bus().await,
                _ = retry => {
                    self.retry_at = None;
                    self.shared.update(|s| s.retry_pending = false);
                    if self.should_run() {
                        tracing::info!(camera = %self.id(), attempt = self.backoff.attempts(), "Retrying ingest start");
                        let _ = self.try_start().await;
                    }
                }
            }
        }

        self.teardown(false).await;
        tracing::debug!(camera = %self.id(), "Ingest coordinator stopped");
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                self.cancel_retry();
                self.shared.update(|s| s.wanted = false);
                self.teardown(true).await;
                self.shared.update(|s| s.state = IngestState::Idle);
                tracing::info!(camera = %self.id(), "Ingest stopped");
                let _ = reply.send(Ok(()));
            }
            Command::Signal(reading, reply) => {
                self.on_signal(reading).await;
                let _ = reply.send(Ok(()));
            }
            Command::Restart(reply) => {
                self.cancel_retry();
                self.teardown(false).await;
                self.shared.update(|s| {
                    s.state = IngestState::Idle;
                    s.errors.clear_recent();
                });
                let result = if self.should_run() && self.shared.read().reading.present {
                    self.try_start().await
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::Drain(timeout, reply) => {
                let result = match &self.active {
                    Some(active) => active.pipeline.drain(timeout).await,
                    None => Ok(()),
                };
                if result.is_ok() {
                    self.teardown(false).await;
                }
                let _ = reply.send(result);
            }
            Command::ForceStop(reply) => {
                self.cancel_retry();
                self.teardown(false).await;
                self.shared.update(|s| s.state = IngestState::Idle);
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown(reply) => {
                self.cancel_retry();
                self.teardown(true).await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn start(&mut self) -> ScenemixResult<()> {
        if !self.shared.config.enabled {
            return Err(ScenemixError::config(format!(
                "camera {} is disabled",
                self.id()
            )));
        }
        self.shared.update(|s| s.wanted = true);
        if self.active.is_some() {
            return Ok(());
        }
        if self.shared.read().state == IngestState::Error {
            self.backoff.reset();
        }
        self.retry_at = None;
        self.try_start().await
    }

    async fn on_signal(&mut self, reading: SignalReading) {
        let previous = self.shared.read().reading;
        self.shared.update(|s| s.reading = reading);

        match (previous.present, reading.present) {
            (true, false) => {
                tracing::warn!(camera = %self.id(), "Signal lost; tearing down ingest");
                self.cancel_retry();
                self.teardown(false).await;
                self.shared.update(|s| s.state = IngestState::Idle);
            }
            (false, true) => {
                tracing::info!(camera = %self.id(), width = reading.width, height = reading.height, "Signal detected");
                if self.should_run() && self.active.is_none() {
                    self.cancel_retry();
                    let _ = self.try_start().await;
                }
            }
            (true, true) if previous.size() != reading.size() => {
                tracing::info!(
                    camera = %self.id(),
                    from = ?previous.size(),
                    to = ?reading.size(),
                    "Resolution changed; rebuilding ingest"
                );
                self.teardown(false).await;
                self.shared.update(|s| s.state = IngestState::Idle);
                if self.should_run() {
                    self.cancel_retry();
                    let _ = self.try_start().await;
                }
            }
            _ => {}
        }
    }

    fn cancel_retry(&mut self) {
        self.retry_at = None;
        self.backoff.reset();
        self.shared.update(|s| {
            s.retry_pending = false;
            s.retries = 0;
        });
    }

    /// One start attempt. Failures are classified and either scheduled for
    /// retry or surfaced as ERROR; the error is returned either way.
    async fn try_start(&mut self) -> ScenemixResult<()> {
        if self.active.is_some() {
            return Ok(());
        }
        let Some(size) = self.shared.read().reading.size() else {
            return Err(ScenemixError::device_unavailable(self.id(), "no signal"));
        };

        match self.bring_up(size).await {
            Ok(()) => {
                self.backoff.reset();
                Ok(())
            }
            Err(err) => {
                self.on_failure(&err);
                Err(err)
            }
        }
    }

    async fn bring_up(&mut self, size: FrameSize) -> ScenemixResult<()> {
        let config = self.shared.config.clone();
        let lease = self.devices.acquire(&config.device_path, &config.id)?;

        self.shared.update(|s| {
            s.state = IngestState::Starting;
            s.active_since = Some(Instant::now());
        });
        tracing::info!(camera = %config.id, %size, device = %config.device_path.display(), "Starting ingest");

        let graph = ingest_graph(&config, size, self.relay.as_ref());
        let pipeline = self.backend.build(&graph)?;

        if let Err(e) = pipeline
            .set_state(PipelineState::Playing, self.settings.start_timeout())
            .await
        {
            if let Err(stop_err) = pipeline
                .set_state(PipelineState::Null, self.settings.stop_timeout())
                .await
            {
                tracing::warn!(camera = %config.id, error = %stop_err, "Failed to release pipeline after failed start");
            }
            drop(pipeline);
            drop(lease);
            return Err(e);
        }

        self.active = Some(ActivePipeline {
            pipeline: Arc::clone(&pipeline),
            _lease: lease,
        });
        self.shared.update(|s| {
            s.state = IngestState::Streaming;
            s.pipeline = Some(pipeline);
            s.retry_pending = false;
            s.retries = 0;
            s.last_error = None;
        });
        tracing::info!(camera = %config.id, "Ingest streaming");
        Ok(())
    }

    fn on_failure(&mut self, err: &ScenemixError) {
        let id = self.id().to_string();
        let delay = if err.is_transient() {
            self.backoff.next_delay()
        } else {
            None
        };

        match delay {
            Some(delay) => {
                self.retry_at = Some(Instant::now() + delay);
                let attempts = self.backoff.attempts();
                self.shared.update(|s| {
                    s.state = IngestState::Idle;
                    s.retry_pending = true;
                    s.retries = attempts;
                    s.last_error = Some(err.to_string());
                    s.pipeline = None;
                    s.active_since = None;
                    s.errors.record(ErrorClass::Recoverable);
                });
                tracing::warn!(camera = %id, error = %err, attempt = attempts, ?delay, "Ingest start failed; retrying");
            }
            None => {
                self.retry_at = None;
                let attempts = self.backoff.attempts();
                self.shared.update(|s| {
                    s.state = IngestState::Error;
                    s.retry_pending = false;
                    s.retries = attempts;
                    s.last_error = Some(err.to_string());
                    s.pipeline = None;
                    s.active_since = None;
                    s.errors.record(ErrorClass::Fatal);
                });
                tracing::error!(camera = %id, error = %err, attempts, "Ingest failed");
            }
        }
    }

    /// Stop the pipeline and release the device. With `graceful`, drain
    /// first so the encoder flushes.
    async fn teardown(&mut self, graceful: bool) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.shared.update(|s| s.state = IngestState::Stopping);

        if graceful {
            if let Err(e) = active.pipeline.drain(self.settings.stop_timeout()).await {
                tracing::warn!(camera = %self.id(), error = %e, "Drain failed; stopping anyway");
            }
        }
        if let Err(e) = active
            .pipeline
            .set_state(PipelineState::Null, self.settings.stop_timeout())
            .await
        {
            tracing::warn!(camera = %self.id(), error = %e, "Pipeline did not reach NULL");
        }

        self.shared.update(|s| {
            s.state = IngestState::Idle;
            s.pipeline = None;
            s.active_since = None;
        });
        drop(active);
        tracing::debug!(camera = %self.id(), "Ingest torn down; device released");
    }

    async fn poll_bus(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        let events = active.pipeline.take_bus_events();
        if events.is_empty() {
            return;
        }

        let mut failure = None;
        for event in events {
            match event.severity {
                BusSeverity::Warning => {
                    tracing::debug!(camera = %self.id(), element = %event.element, message = %event.message, "Pipeline warning");
                    self.shared.update(|s| s.errors.record(ErrorClass::Warning));
                }
                BusSeverity::Error => {
                    tracing::warn!(
                        camera = %self.id(),
                        element = %event.element,
                        message = %event.message,
                        debug = ?event.debug,
                        "Pipeline error"
                    );
                    failure.get_or_insert(ScenemixError::bus(event.element, event.message));
                }
                BusSeverity::Eos => {
                    failure.get_or_insert(ScenemixError::bus(
                        active.pipeline.name(),
                        "unexpected end of stream",
                    ));
                }
            }
        }

        if let Some(err) = failure {
            self.teardown(false).await;
            self.on_failure(&err);
        }
    }
}

struct CameraHandle {
    shared: Arc<CameraShared>,
    commands: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Owns every camera's ingest pipeline.
///
/// Cloning yields another handle to the same set of coordinators.
#[derive(Clone)]
pub struct IngestManager {
    cameras: Arc<BTreeMap<String, CameraHandle>>,
}

impl IngestManager {
    /// Spawn one coordinator per configured camera. Must be called inside a
    /// tokio runtime. Cameras start idle without operator intent; call
    /// [`IngestManager::start_all`] or [`IngestManager::start`].
    pub fn spawn(
        cameras: &[CameraConfig],
        settings: IngestSettings,
        backend: Arc<dyn PipelineBackend>,
        relay: Arc<dyn MediaRelay>,
        devices: DeviceRegistry,
    ) -> Self {
        let mut handles = BTreeMap::new();
        for camera in cameras {
            let shared = Arc::new(CameraShared {
                config: camera.clone(),
                snapshot: RwLock::new(Snapshot {
                    state: IngestState::Idle,
                    reading: SignalReading::absent(),
                    wanted: false,
                    retry_pending: false,
                    retries: 0,
                    last_error: None,
                    pipeline: None,
                    active_since: None,
                    errors: ErrorWindow::new(settings.error_window()),
                }),
            });
            let worker = CameraWorker {
                shared: Arc::clone(&shared),
                settings: settings.clone(),
                backend: Arc::clone(&backend),
                relay: Arc::clone(&relay),
                devices: devices.clone(),
                active: None,
                backoff: Backoff::new(settings.retry_base(), settings.retry_max(), settings.retry_cap),
                retry_at: None,
            };
            let (tx, rx) = mpsc::channel(32);
            let task = tokio::spawn(worker.run(rx));
            handles.insert(
                camera.id.clone(),
                CameraHandle {
                    shared,
                    commands: tx,
                    task: Mutex::new(Some(task)),
                },
            );
        }
        tracing::info!(cameras = handles.len(), "Ingest manager started");
        Self {
            cameras: Arc::new(handles),
        }
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.cameras.keys().cloned().collect()
    }

    pub fn contains(&self, camera_id: &str) -> bool {
        self.cameras.contains_key(camera_id)
    }

    /// Mark the camera wanted and bring its pipeline up at the detected
    /// resolution. Fails fast without signal; the camera then starts on its
    /// own once signal arrives.
    pub async fn start(&self, camera_id: &str) -> ScenemixResult<()> {
        self.request(camera_id, Command::Start).await
    }

    /// Drain, tear down, and release the device before returning.
    pub async fn stop(&self, camera_id: &str) -> ScenemixResult<()> {
        self.request(camera_id, Command::Stop).await
    }

    /// Start every enabled camera; returns how many are streaming.
    pub async fn start_all(&self) -> usize {
        let mut streaming = 0;
        for (id, handle) in self.cameras.iter() {
            if !handle.shared.config.enabled {
                continue;
            }
            match self.start(id).await {
                Ok(()) => streaming += 1,
                Err(e) => tracing::info!(camera = %id, reason = %e, "Camera not started yet"),
            }
        }
        streaming
    }

    pub fn status(&self, camera_id: &str) -> ScenemixResult<IngestStatus> {
        Ok(self.camera(camera_id)?.shared.status())
    }

    pub fn statuses(&self) -> Vec<IngestStatus> {
        self.cameras.values().map(|h| h.shared.status()).collect()
    }

    /// Apply a signal transition from the monitor.
    pub async fn handle_signal(&self, event: &SignalEvent) -> ScenemixResult<()> {
        self.apply_reading(&event.camera_id, event.reading).await
    }

    pub async fn apply_reading(&self, camera_id: &str, reading: SignalReading) -> ScenemixResult<()> {
        self.request(camera_id, |reply| Command::Signal(reading, reply))
            .await
    }

    /// Tear down and rebuild from the camera's configuration, resetting
    /// the retry budget.
    pub async fn restart(&self, camera_id: &str) -> ScenemixResult<()> {
        self.request(camera_id, Command::Restart).await
    }

    /// Send EOS and wait for it; on success the pipeline is torn down.
    pub async fn drain(&self, camera_id: &str, timeout: Duration) -> ScenemixResult<()> {
        self.request(camera_id, |reply| Command::Drain(timeout, reply))
            .await
    }

    /// Tear down without draining.
    pub async fn force_stop(&self, camera_id: &str) -> ScenemixResult<()> {
        self.request(camera_id, Command::ForceStop).await
    }

    /// Published stream of a streaming camera.
    pub fn stream_handle(&self, camera_id: &str) -> Option<StreamHandle> {
        self.status(camera_id).ok().and_then(|s| s.stream_handle)
    }

    pub fn camera_config(&self, camera_id: &str) -> Option<CameraConfig> {
        self.cameras.get(camera_id).map(|h| h.shared.config.clone())
    }

    /// Health snapshot for the watchdog.
    pub fn probe(&self, camera_id: &str) -> ScenemixResult<ComponentProbe> {
        Ok(self.camera(camera_id)?.shared.probe(Instant::now()))
    }

    /// Forward monitor events into the coordinators until the channel closes.
    pub fn spawn_signal_listener(&self, mut events: mpsc::Receiver<SignalEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = manager.handle_signal(&event).await {
                    tracing::warn!(camera = %event.camera_id, error = %e, "Signal event not applied");
                }
            }
        })
    }

    /// Stop every camera and wait for the coordinators to exit.
    pub async fn shutdown(&self) {
        for (id, handle) in self.cameras.iter() {
            let (tx, rx) = oneshot::channel();
            if handle.commands.send(Command::Shutdown(tx)).await.is_ok() {
                let _ = rx.await;
            }
            let task = handle
                .task
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    tracing::warn!(camera = %id, error = %e, "Ingest coordinator panicked");
                }
            }
        }
        tracing::info!("Ingest manager shut down");
    }

    fn camera(&self, camera_id: &str) -> ScenemixResult<&CameraHandle> {
        self.cameras
            .get(camera_id)
            .ok_or_else(|| ScenemixError::not_found("camera", camera_id))
    }

    async fn request(&self, camera_id: &str, make: impl FnOnce(Reply) -> Command) -> ScenemixResult<()> {
        let handle = self.camera(camera_id)?;
        let (tx, rx) = oneshot::channel();
        handle
            .commands
            .send(make(tx))
            .await
            .map_err(|_| ScenemixError::shutdown(component_name(camera_id)))?;
        rx.await
            .map_err(|_| ScenemixError::shutdown(component_name(camera_id)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenemix_media_graph::fake::{FakeBackend, FakeControl};
    use scenemix_media_graph::relay::RtspRelay;

    fn settings() -> IngestSettings {
        IngestSettings {
            start_timeout_ms: 1000,
            stop_timeout_ms: 1000,
            retry_base_ms: 100,
            retry_max_ms: 400,
            retry_cap: 2,
            bus_poll_ms: 50,
            error_window_ms: 10_000,
        }
    }

    fn manager(cameras: &[CameraConfig]) -> (IngestManager, FakeControl) {
        let backend = FakeBackend::new();
        let control = backend.control();
        let manager = IngestManager::spawn(
            cameras,
            settings(),
            Arc::new(backend),
            Arc::new(RtspRelay::new("rtsp://127.0.0.1:8554", 200)),
            DeviceRegistry::new(),
        );
        (manager, control)
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_signal_fails_fast_then_starts_on_detection() {
        let (ingest, control) = manager(&[CameraConfig::new("cam0", "/dev/video0")]);

        let err = ingest.start("cam0").await.unwrap_err();
        assert!(matches!(err, ScenemixError::DeviceUnavailable { .. }));
        assert_eq!(ingest.status("cam0").unwrap().state, IngestState::Idle);
        assert_eq!(control.build_count("ingest-cam0"), 0);

        ingest
            .apply_reading("cam0", SignalReading::present(1920, 1080))
            .await
            .unwrap();
        let status = ingest.status("cam0").unwrap();
        assert_eq!(status.state, IngestState::Streaming);
        assert_eq!(status.signal, SignalState::Streaming);
        assert_eq!(status.stream_handle, Some(StreamHandle::new("cam0")));
        assert_eq!(status.resolution, Some(FrameSize { width: 1920, height: 1080 }));
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_change_rebuilds_at_new_size() {
        let (ingest, control) = manager(&[CameraConfig::new("cam0", "/dev/video0")]);
        ingest
            .apply_reading("cam0", SignalReading::present(1920, 1080))
            .await
            .unwrap();
        ingest.start("cam0").await.unwrap();

        ingest
            .apply_reading("cam0", SignalReading::present(1280, 720))
            .await
            .unwrap();
        assert_eq!(control.build_count("ingest-cam0"), 2);
        let launch = control.last_build("ingest-cam0").unwrap().launch;
        assert!(launch.contains("width=1280,height=720"));
        assert_eq!(control.open_device_handles("/dev/video0"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_backoff_then_surface_error() {
        let (ingest, control) = manager(&[CameraConfig::new("cam0", "/dev/video0")]);
        control.fail_transitions("ingest-cam0", 10);
        ingest
            .apply_reading("cam0", SignalReading::present(1920, 1080))
            .await
            .unwrap();

        assert!(ingest.start("cam0").await.is_err());
        let status = ingest.status("cam0").unwrap();
        assert_eq!(status.state, IngestState::Idle);
        assert_eq!(status.retries, 1);

        // Retries at +100ms and +200ms, then the cap is exceeded.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let status = ingest.status("cam0").unwrap();
        assert_eq!(status.state, IngestState::Error);
        assert_eq!(status.signal, SignalState::Error);
        assert_eq!(control.build_count("ingest-cam0"), 3);
        assert!(ingest.probe("cam0").unwrap().fatal);

        control.clear_faults();
        ingest.restart("cam0").await.unwrap();
        assert_eq!(ingest.status("cam0").unwrap().state, IngestState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn start_timeout_goes_idle_with_retry_before_error() {
        let (ingest, control) = manager(&[CameraConfig::new("cam0", "/dev/video0")]);
        control.hang_transitions("ingest-cam0", 10);
        ingest
            .apply_reading("cam0", SignalReading::present(1920, 1080))
            .await
            .unwrap();

        let err = ingest.start("cam0").await.unwrap_err();
        assert!(matches!(err, ScenemixError::StateTransitionTimeout { .. }), "{err}");
        let status = ingest.status("cam0").unwrap();
        assert_eq!(status.state, IngestState::Idle);
        assert_eq!(status.retries, 1);
        assert_eq!(control.open_device_handles("/dev/video0"), 0);

        // Two more timed-out attempts exhaust the cap.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let status = ingest.status("cam0").unwrap();
        assert_eq!(status.state, IngestState::Error);
        assert_eq!(control.build_count("ingest-cam0"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn bus_error_tears_down_and_retries() {
        let (ingest, control) = manager(&[CameraConfig::new("cam0", "/dev/video0")]);
        ingest
            .apply_reading("cam0", SignalReading::present(1920, 1080))
            .await
            .unwrap();
        ingest.start("cam0").await.unwrap();

        control.inject_bus_event(
            "ingest-cam0",
            scenemix_media_graph::backend::BusEvent::error("v4l2src0", "Internal data stream error"),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ingest.status("cam0").unwrap().state, IngestState::Idle);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ingest.status("cam0").unwrap().state, IngestState::Streaming);
        assert_eq!(control.build_count("ingest-cam0"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_device_and_clears_intent() {
        let (ingest, control) = manager(&[CameraConfig::new("cam0", "/dev/video0")]);
        ingest
            .apply_reading("cam0", SignalReading::present(1920, 1080))
            .await
            .unwrap();
        ingest.start("cam0").await.unwrap();
        assert_eq!(control.open_device_handles("/dev/video0"), 1);

        ingest.stop("cam0").await.unwrap();
        assert_eq!(control.open_device_handles("/dev/video0"), 0);
        let probe = ingest.probe("cam0").unwrap();
        assert_eq!(probe.expected_state, "IDLE");
        assert!(probe.state_matches());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_camera_refuses_start() {
        let mut camera = CameraConfig::new("cam3", "/dev/video3");
        camera.enabled = false;
        let (ingest, _) = manager(&[camera]);
        let err = ingest.start("cam3").await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
        assert!(matches!(
            ingest.status("cam9"),
            Err(ScenemixError::NotFound { .. })
        ));
    }
}
