use std::sync::Arc;
use std::time::Duration;

use scenemix_common::config::{CameraConfig, IngestSettings, MixerSettings, WatchdogSettings};
use scenemix_common::health::HealthStatus;
use scenemix_ingest_engine::{DeviceRegistry, IngestManager, IngestState, SignalReading};
use scenemix_media_graph::fake::{FakeBackend, FakeControl};
use scenemix_media_graph::relay::RtspRelay;
use scenemix_mixer_core::{MixerCore, MixerState, Transition};
use scenemix_scene_model::manager::SceneManager;
use scenemix_scene_model::scene::KnownSources;
use scenemix_scene_model::store::default_scenes;
use scenemix_watchdog::{standard_components, RecoveryOutcome, Watchdog};

struct Rig {
    ingest: IngestManager,
    mixer: MixerCore,
    watchdog: Watchdog,
    control: FakeControl,
}

impl Rig {
    async fn shutdown(self) {
        self.watchdog.shutdown().await;
        self.mixer.shutdown().await;
        self.ingest.shutdown().await;
    }
}

async fn rig(scene: &str) -> Rig {
    rig_with(scene, WatchdogSettings::default()).await
}

async fn rig_with(scene: &str, settings: WatchdogSettings) -> Rig {
    let cameras: Vec<CameraConfig> = (0..4)
        .map(|i| CameraConfig::new(format!("cam{i}"), format!("/dev/video{i}")))
        .collect();
    let backend = Arc::new(FakeBackend::new());
    let control = backend.control();
    let relay = Arc::new(RtspRelay::new("rtsp://127.0.0.1:8554", 200));

    let ingest = IngestManager::spawn(
        &cameras,
        IngestSettings::default(),
        backend.clone(),
        relay.clone(),
        DeviceRegistry::new(),
    );
    for id in ingest.camera_ids() {
        ingest
            .apply_reading(&id, SignalReading::present(1920, 1080))
            .await
            .unwrap();
    }
    ingest.start_all().await;

    let ids = ["cam0", "cam1", "cam2", "cam3"];
    let scenes = SceneManager::in_memory(default_scenes(&ids), KnownSources::new(ids));
    let mixer = MixerCore::spawn(
        MixerSettings::default(),
        scenes,
        Arc::new(ingest.clone()),
        backend,
        relay,
        settings.thresholds(),
    );
    mixer.set_scene(scene, Transition::Cut).await.unwrap();
    mixer.start().await.unwrap();

    let watchdog = Watchdog::new(standard_components(&ingest, &mixer), settings);
    watchdog.spawn();
    Rig {
        ingest,
        mixer,
        watchdog,
        control,
    }
}

#[tokio::test(start_paused = true)]
async fn stale_mixer_is_rebuilt_with_the_previous_scene() {
    let rig = rig("pip").await;
    assert_eq!(rig.control.build_count("mixer"), 1);

    rig.control.stall("mixer");
    tokio::time::sleep(Duration::from_secs(60)).await;

    let status = rig.mixer.status();
    assert_eq!(status.state, MixerState::Playing);
    assert_eq!(status.active_scene.as_deref(), Some("pip"));
    assert_eq!(status.health, HealthStatus::Healthy);
    assert_eq!(rig.control.build_count("mixer"), 2);

    let recovery = rig.watchdog.recovery_status("mixer").unwrap();
    assert_eq!(recovery.recoveries, 1);
    assert_eq!(recovery.last_outcome, Some(RecoveryOutcome::Recovered));
    assert!(rig
        .watchdog
        .health()
        .values()
        .all(|h| *h == HealthStatus::Healthy));
    // Cameras were never touched.
    assert_eq!(rig.control.build_count("ingest-cam0"), 1);

    rig.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_camera_is_restarted_alone() {
    let rig = rig("dual").await;
    rig.control.stall("ingest-cam1");
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(rig.ingest.status("cam1").unwrap().state, IngestState::Streaming);
    assert_eq!(rig.control.build_count("ingest-cam1"), 2);
    assert_eq!(rig.control.build_count("ingest-cam0"), 1);
    assert_eq!(rig.control.build_count("mixer"), 1);
    assert_eq!(rig.watchdog.health()["ingest:cam1"], HealthStatus::Healthy);

    rig.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unrecoverable_mixer_ends_failed_until_reset() {
    let rig = rig("dual").await;
    rig.control.fail_builds("mixer", 100);
    rig.control.stall("mixer");
    tokio::time::sleep(Duration::from_secs(600)).await;

    let recovery = rig.watchdog.recovery_status("mixer").unwrap();
    assert!(recovery.exhausted);
    assert_eq!(recovery.failed_attempts, WatchdogSettings::default().max_recovery_attempts);
    assert_eq!(rig.watchdog.health()["mixer"], HealthStatus::Failed);
    assert_eq!(rig.mixer.status().state, MixerState::Error);

    rig.control.clear_faults();
    rig.watchdog.reset("mixer").unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(rig.mixer.status().state, MixerState::Playing);
    assert_eq!(rig.mixer.status().active_scene.as_deref(), Some("dual"));

    rig.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn overlong_mixer_rebuild_fails_the_attempt_and_the_next_one_recovers() {
    // Shorter than the mixer's own transition timeout.
    let settings = WatchdogSettings {
        step_timeout_ms: 3_000,
        ..WatchdogSettings::default()
    };
    let rig = rig_with("dual", settings).await;
    rig.control.hang_transitions("mixer", 1);
    rig.control.stall("mixer");

    let mut reason = None;
    for _ in 0..120 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Some(RecoveryOutcome::Failed(r)) = rig.watchdog.recovery_status("mixer").unwrap().last_outcome {
            reason = Some(r);
            break;
        }
    }
    let reason = reason.expect("first attempt should fail");
    assert!(reason.contains("rebuild did not finish"), "{reason}");

    tokio::time::sleep(Duration::from_secs(60)).await;
    let recovery = rig.watchdog.recovery_status("mixer").unwrap();
    assert_eq!(recovery.last_outcome, Some(RecoveryOutcome::Recovered));
    assert_eq!(recovery.failed_attempts, 0);
    assert_eq!(rig.mixer.status().state, MixerState::Playing);
    assert_eq!(rig.mixer.status().active_scene.as_deref(), Some("dual"));

    rig.shutdown().await;
}
