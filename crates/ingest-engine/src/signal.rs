//! HDMI signal detection.
//!
//! Devices are polled on a fixed interval whether or not a pipeline is
//! running. An absent, busy, or unresponsive device is a normal reading
//! (`present == false`), never an error.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scenemix_common::config::{CameraConfig, SignalSettings};
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Detected frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalReading {
    pub present: bool,
    pub width: u32,
    pub height: u32,
}

impl SignalReading {
    pub fn absent() -> Self {
        Self {
            present: false,
            width: 0,
            height: 0,
        }
    }

    pub fn present(width: u32, height: u32) -> Self {
        if width == 0 || height == 0 {
            return Self::absent();
        }
        Self {
            present: true,
            width,
            height,
        }
    }

    pub fn size(&self) -> Option<FrameSize> {
        self.present.then_some(FrameSize {
            width: self.width,
            height: self.height,
        })
    }
}

/// Signal state of a camera input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalState {
    NoSignal,
    SignalDetected,
    Streaming,
    Error,
}

impl fmt::Display for SignalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoSignal => "NO_SIGNAL",
            Self::SignalDetected => "SIGNAL_DETECTED",
            Self::Streaming => "STREAMING",
            Self::Error => "ERROR",
        })
    }
}

/// A signal transition for one camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEvent {
    pub camera_id: String,
    pub kind: SignalEventKind,
    pub reading: SignalReading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEventKind {
    Detected,
    Lost,
    ResolutionChanged,
}

/// Presence/resolution query for a device node.
///
/// Implementations must return rather than panic on any device condition.
/// [`SignalMonitor`] drops a call that outlives the probe timeout, and
/// whatever the call started (child processes included) must end with it.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn probe(&self, device: &Path) -> SignalReading;
}

/// Probe via `v4l2-ctl`.
///
/// HDMI bridges report the incoming timings through
/// `--query-dv-timings`; plain UVC devices only answer `--get-fmt-video`.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2Probe;

#[async_trait]
impl DeviceProbe for V4l2Probe {
    async fn probe(&self, device: &Path) -> SignalReading {
        if !device.exists() {
            return SignalReading::absent();
        }

        if let Some(stdout) = run_v4l2_ctl(device, "--query-dv-timings").await {
            if let Some((w, h)) = parse_dv_timings(&stdout) {
                return SignalReading::present(w, h);
            }
        }

        run_v4l2_ctl(device, "--get-fmt-video")
            .await
            .and_then(|stdout| parse_fmt_video(&stdout))
            .map(|(w, h)| SignalReading::present(w, h))
            .unwrap_or_else(SignalReading::absent)
    }
}

async fn run_v4l2_ctl(device: &Path, query: &str) -> Option<String> {
    let mut command = Command::new("v4l2-ctl");
    command.arg("--device").arg(device).arg(query);
    let stdout = capture_stdout(command).await;
    if stdout.is_none() {
        tracing::trace!(device = %device.display(), query, "v4l2-ctl query failed");
    }
    stdout
}

/// Run `command` to completion and return its stdout if it succeeded.
/// Dropping the future kills the child.
async fn capture_stdout(mut command: Command) -> Option<String> {
    let output = command
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `Active width: 1920` / `Active height: 1080`.
pub fn parse_dv_timings(stdout: &str) -> Option<(u32, u32)> {
    let field = |name: &str| {
        stdout.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == name).then(|| value.trim().parse::<u32>().ok())?
        })
    };
    let width = field("Active width")?;
    let height = field("Active height")?;
    (width > 0 && height > 0).then_some((width, height))
}

/// Parse `Width/Height      : 1920/1080`.
pub fn parse_fmt_video(stdout: &str) -> Option<(u32, u32)> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != "Width/Height" {
            return None;
        }
        let (w, h) = value.trim().split_once('/')?;
        let (w, h) = (w.trim().parse::<u32>().ok()?, h.trim().parse::<u32>().ok()?);
        (w > 0 && h > 0).then_some((w, h))
    })
}

/// Probe with settable readings, for dry runs and tests.
#[derive(Debug, Default)]
pub struct ManualProbe {
    readings: Mutex<HashMap<PathBuf, SignalReading>>,
}

impl ManualProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, device: impl Into<PathBuf>, reading: SignalReading) {
        self.readings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(device.into(), reading);
    }
}

#[async_trait]
impl DeviceProbe for ManualProbe {
    async fn probe(&self, device: &Path) -> SignalReading {
        self.readings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(device)
            .copied()
            .unwrap_or_else(SignalReading::absent)
    }
}

/// Polls every configured camera and emits transitions.
pub struct SignalMonitor {
    devices: Vec<(String, PathBuf)>,
    probe: Arc<dyn DeviceProbe>,
    settings: SignalSettings,
    last: Mutex<HashMap<String, SignalReading>>,
}

impl SignalMonitor {
    pub fn new(cameras: &[CameraConfig], probe: Arc<dyn DeviceProbe>, settings: SignalSettings) -> Self {
        Self {
            devices: cameras
                .iter()
                .map(|c| (c.id.clone(), c.device_path.clone()))
                .collect(),
            probe,
            settings,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Poll one camera. Completes within the configured probe timeout; an
    /// unknown camera, a slow device, or a failed probe all read as absent.
    pub async fn poll(&self, camera_id: &str) -> SignalReading {
        let Some((_, device)) = self.devices.iter().find(|(id, _)| id == camera_id) else {
            tracing::warn!(camera = %camera_id, "Poll for unknown camera");
            return SignalReading::absent();
        };
        probe_bounded(self.probe.as_ref(), device, self.settings.probe_timeout()).await
    }

    /// Poll every camera concurrently and return the transitions since the
    /// previous round. The first round reports every present camera as
    /// detected.
    pub async fn poll_all(&self) -> Vec<SignalEvent> {
        let mut set = JoinSet::new();
        for (id, device) in &self.devices {
            let probe = Arc::clone(&self.probe);
            let (id, device) = (id.clone(), device.clone());
            let timeout = self.settings.probe_timeout();
            set.spawn(async move {
                let reading = probe_bounded(probe.as_ref(), &device, timeout).await;
                (id, reading)
            });
        }

        let mut readings = Vec::with_capacity(self.devices.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => readings.push(pair),
                Err(e) => tracing::warn!(error = %e, "Signal probe task failed"),
            }
        }
        readings.sort_by(|a, b| a.0.cmp(&b.0));

        readings
            .into_iter()
            .filter_map(|(id, reading)| self.observe(&id, reading))
            .collect()
    }

    /// Record a reading and return the transition it causes, if any.
    pub fn observe(&self, camera_id: &str, reading: SignalReading) -> Option<SignalEvent> {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = last
            .insert(camera_id.to_string(), reading)
            .unwrap_or_else(SignalReading::absent);

        let kind = match (previous.present, reading.present) {
            (false, true) => SignalEventKind::Detected,
            (true, false) => SignalEventKind::Lost,
            (true, true) if previous.size() != reading.size() => SignalEventKind::ResolutionChanged,
            _ => return None,
        };

        match kind {
            SignalEventKind::Lost => tracing::warn!(camera = %camera_id, "Signal lost"),
            _ => tracing::info!(
                camera = %camera_id,
                width = reading.width,
                height = reading.height,
                ?kind,
                "Signal change"
            ),
        }

        Some(SignalEvent {
            camera_id: camera_id.to_string(),
            kind,
            reading,
        })
    }

    /// Last reading per camera.
    pub fn last_reading(&self, camera_id: &str) -> SignalReading {
        self.last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(camera_id)
            .copied()
            .unwrap_or_else(SignalReading::absent)
    }

    /// Poll on the configured interval until `shutdown` flips, forwarding
    /// transitions to `events`.
    pub async fn run(self: Arc<Self>, events: mpsc::Sender<SignalEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for event in self.poll_all().await {
                        if events.send(event).await.is_err() {
                            tracing::debug!("Signal listener gone; monitor stopping");
                            return;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Signal monitor stopped");
    }
}

/// Run one probe; an expired call is dropped and reads as absent.
async fn probe_bounded(probe: &dyn DeviceProbe, device: &Path, timeout: Duration) -> SignalReading {
    match tokio::time::timeout(timeout, probe.probe(device)).await {
        Ok(reading) => reading,
        Err(_) => {
            tracing::debug!(device = %device.display(), ?timeout, "Signal probe timed out");
            SignalReading::absent()
        }
    }
}
