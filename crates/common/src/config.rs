//! Application configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ScenemixError, ScenemixResult};
use crate::health::HealthThresholds;

/// Maximum number of physical camera inputs on the appliance.
pub const MAX_CAMERAS: usize = 4;

/// Source ids that never map to a camera; the mixer synthesizes them.
pub const RESERVED_SOURCES: &[&str] = &["black", "bars"];

/// Global application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Static camera list.
    pub cameras: Vec<CameraConfig>,

    /// Scene store (definitions plus last-known-good reference).
    pub scenes_file: PathBuf,

    /// Media relay endpoint.
    pub relay: RelayConfig,

    /// Signal polling.
    pub signal: SignalSettings,

    /// Ingest pipelines.
    pub ingest: IngestSettings,

    /// Compositing pipeline.
    pub mixer: MixerSettings,

    /// Supervision and recovery.
    pub watchdog: WatchdogSettings,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// One capture input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Camera id used by scenes (`cam0`).
    pub id: String,

    /// V4L2 device node.
    pub device_path: PathBuf,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub codec: VideoCodec,

    /// Target encoder bitrate.
    #[serde(default = "default_camera_bitrate")]
    pub bitrate_kbps: u32,

    #[serde(default = "default_framerate")]
    pub framerate: u32,
}

/// Video codec used for published streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
}

/// Where published streams go and where subscribers pull them from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Base URL; stream handles are appended as path segments.
    pub base_url: String,

    /// Jitter buffer for subscribers.
    pub latency_ms: u32,
}

/// Signal monitor timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalSettings {
    pub poll_interval_ms: u64,

    /// Upper bound for one device probe.
    pub probe_timeout_ms: u64,
}

/// Ingest pipeline timing and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub start_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,

    /// Failed starts tolerated before the camera surfaces ERROR.
    pub retry_cap: u32,

    /// How often each camera coordinator drains its pipeline bus.
    pub bus_poll_ms: u64,

    pub error_window_ms: u64,
}

/// Mixer pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerSettings {
    /// Bound for each state transition.
    pub transition_timeout_ms: u64,

    /// Scene applied by `start()` when nothing else is known.
    pub default_scene: Option<String>,

    /// Relay handle the program output is published under.
    pub output_handle: String,

    pub codec: VideoCodec,
    pub bitrate_kbps: u32,
    pub framerate: u32,

    /// Duration of an AUTO transition.
    pub auto_transition_ms: u64,

    /// Interval between alpha-ramp steps.
    pub transition_step_ms: u64,

    pub bus_poll_ms: u64,

    pub error_window_ms: u64,
}

/// Watchdog thresholds and recovery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub error_window_ms: u64,
    pub persistent_error_count: u32,

    /// Minimum time between two recoveries of one component.
    pub cooldown_ms: u64,

    /// Graceful drain bound before a forced stop.
    pub drain_timeout_ms: u64,

    /// Wait after stopping, for the device to be released.
    pub settle_delay_ms: u64,

    /// Bound on one forced stop or rebuild; expiry fails the recovery.
    pub step_timeout_ms: u64,

    pub verify_window_ms: u64,
    pub verify_poll_ms: u64,
    pub recovery_backoff_base_ms: u64,
    pub recovery_backoff_max_ms: u64,

    /// Failed recovery attempts before FAILED is permanent.
    pub max_recovery_attempts: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "scenemix_mixer_core=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_camera_bitrate() -> u32 {
    4000
}

fn default_framerate() -> u32 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cameras: (0..MAX_CAMERAS)
                .map(|idx| CameraConfig::new(format!("cam{idx}"), format!("/dev/video{idx}")))
                .collect(),
            scenes_file: default_data_dir().join("scenes.json"),
            relay: RelayConfig::default(),
            signal: SignalSettings::default(),
            ingest: IngestSettings::default(),
            mixer: MixerSettings::default(),
            watchdog: WatchdogSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CameraConfig {
    pub fn new(id: impl Into<String>, device_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            device_path: device_path.into(),
            enabled: true,
            codec: VideoCodec::default(),
            bitrate_kbps: default_camera_bitrate(),
            framerate: default_framerate(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: "rtsp://127.0.0.1:8554".to_string(),
            latency_ms: 200,
        }
    }
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            probe_timeout_ms: 1500,
        }
    }
}

impl SignalSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            start_timeout_ms: 10_000,
            stop_timeout_ms: 10_000,
            retry_base_ms: 1000,
            retry_max_ms: 30_000,
            retry_cap: 5,
            bus_poll_ms: 500,
            error_window_ms: 30_000,
        }
    }
}

impl IngestSettings {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn bus_poll(&self) -> Duration {
        Duration::from_millis(self.bus_poll_ms)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_millis(self.error_window_ms)
    }
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            transition_timeout_ms: 10_000,
            default_scene: None,
            output_handle: "program".to_string(),
            codec: VideoCodec::H264,
            bitrate_kbps: 6000,
            framerate: 30,
            auto_transition_ms: 1000,
            transition_step_ms: 40,
            bus_poll_ms: 250,
            error_window_ms: 30_000,
        }
    }
}

impl MixerSettings {
    pub fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_timeout_ms)
    }

    pub fn auto_transition(&self) -> Duration {
        Duration::from_millis(self.auto_transition_ms)
    }

    pub fn transition_step(&self) -> Duration {
        Duration::from_millis(self.transition_step_ms.max(1))
    }

    pub fn bus_poll(&self) -> Duration {
        Duration::from_millis(self.bus_poll_ms.max(1))
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_millis(self.error_window_ms)
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            stale_threshold_ms: 10_000,
            error_window_ms: 30_000,
            persistent_error_count: 5,
            cooldown_ms: 30_000,
            drain_timeout_ms: 5000,
            settle_delay_ms: 2000,
            step_timeout_ms: 30_000,
            verify_window_ms: 15_000,
            verify_poll_ms: 500,
            recovery_backoff_base_ms: 5000,
            recovery_backoff_max_ms: 60_000,
            max_recovery_attempts: 5,
        }
    }
}

impl WatchdogSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn verify_window(&self) -> Duration {
        Duration::from_millis(self.verify_window_ms)
    }

    pub fn verify_poll(&self) -> Duration {
        Duration::from_millis(self.verify_poll_ms.max(1))
    }

    pub fn recovery_backoff_base(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_base_ms)
    }

    pub fn recovery_backoff_max(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_max_ms)
    }

    /// Thresholds for [`crate::health::classify`].
    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            stale_after: Duration::from_millis(self.stale_threshold_ms),
            persistent_errors: self.persistent_error_count,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match Self::load_from(&config_path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to load config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Load and validate config from an explicit path.
    pub fn load_from(path: impl AsRef<Path>) -> ScenemixResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ScenemixError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> ScenemixResult<()> {
        if self.cameras.len() > MAX_CAMERAS {
            return Err(ScenemixError::config(format!(
                "{} cameras configured, at most {MAX_CAMERAS} supported",
                self.cameras.len()
            )));
        }

        let mut ids = HashSet::new();
        let mut devices = HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(ScenemixError::config("camera id must not be empty"));
            }
            if RESERVED_SOURCES.contains(&camera.id.as_str()) {
                return Err(ScenemixError::config(format!(
                    "camera id '{}' collides with a reserved virtual source",
                    camera.id
                )));
            }
            if !ids.insert(camera.id.as_str()) {
                return Err(ScenemixError::config(format!(
                    "duplicate camera id '{}'",
                    camera.id
                )));
            }
            if !devices.insert(camera.device_path.as_path()) {
                return Err(ScenemixError::config(format!(
                    "device {} assigned to more than one camera",
                    camera.device_path.display()
                )));
            }
            if camera.bitrate_kbps == 0 || camera.framerate == 0 {
                return Err(ScenemixError::config(format!(
                    "camera '{}' needs a non-zero bitrate and framerate",
                    camera.id
                )));
            }
        }

        for (label, value) in [
            ("signal.probe_timeout_ms", self.signal.probe_timeout_ms),
            ("ingest.start_timeout_ms", self.ingest.start_timeout_ms),
            ("ingest.stop_timeout_ms", self.ingest.stop_timeout_ms),
            ("mixer.transition_timeout_ms", self.mixer.transition_timeout_ms),
            ("watchdog.stale_threshold_ms", self.watchdog.stale_threshold_ms),
            ("watchdog.drain_timeout_ms", self.watchdog.drain_timeout_ms),
            ("watchdog.step_timeout_ms", self.watchdog.step_timeout_ms),
            ("watchdog.verify_window_ms", self.watchdog.verify_window_ms),
        ] {
            if value == 0 {
                return Err(ScenemixError::config(format!("{label} must be non-zero")));
            }
        }

        if self.mixer.auto_transition_ms > self.mixer.transition_timeout_ms {
            return Err(ScenemixError::config(format!(
                "mixer.auto_transition_ms ({}) exceeds mixer.transition_timeout_ms ({})",
                self.mixer.auto_transition_ms, self.mixer.transition_timeout_ms
            )));
        }

        if self.mixer.framerate == 0 || self.mixer.bitrate_kbps == 0 {
            return Err(ScenemixError::config(
                "mixer needs a non-zero bitrate and framerate",
            ));
        }

        Ok(())
    }

    /// Enabled cameras only.
    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.iter().filter(|c| c.enabled)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("scenemix").join("config.json")
}

/// Default data directory (scene store).
fn default_data_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local").join("share")
        });
    base.join("scenemix")
}
