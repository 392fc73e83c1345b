//! Run the full mixer stack until Ctrl+C.

use std::sync::Arc;

use scenemix_common::config::AppConfig;
use scenemix_ingest_engine::{
    DeviceProbe, DeviceRegistry, IngestManager, ManualProbe, SignalMonitor, SignalReading,
    V4l2Probe,
};
use scenemix_media_graph::backend::PipelineBackend;
use scenemix_media_graph::fake::FakeBackend;
use scenemix_media_graph::gst_backend::GstBackend;
use scenemix_media_graph::relay::RtspRelay;
use scenemix_mixer_core::{MixerCore, Transition};
use scenemix_scene_model::manager::SceneManager;
use scenemix_scene_model::scene::KnownSources;
use scenemix_scene_model::store::default_scenes;
use scenemix_watchdog::{standard_components, Watchdog};
use tokio::sync::{mpsc, watch};

/// Signal a dry run reports for every enabled camera.
const DRY_RUN_SIGNAL: (u32, u32) = (1920, 1080);

pub async fn run(config: AppConfig, dry_run: bool, scene: Option<String>) -> anyhow::Result<()> {
    println!("Starting SceneMix{}", if dry_run { " (dry run)" } else { "" });
    println!("  Cameras: {}", config.enabled_cameras().count());
    println!("  Relay: {}", config.relay.base_url);
    println!("  Output: {}", config.mixer.output_handle);
    println!();

    let known = KnownSources::from_cameras(&config.cameras);
    let (backend, probe, scenes): (Arc<dyn PipelineBackend>, Arc<dyn DeviceProbe>, SceneManager) =
        if dry_run {
            let probe = ManualProbe::new();
            for camera in config.enabled_cameras() {
                probe.set(
                    camera.device_path.clone(),
                    SignalReading::present(DRY_RUN_SIGNAL.0, DRY_RUN_SIGNAL.1),
                );
            }
            let ids: Vec<&str> = known.cameras().collect();
            let scenes = SceneManager::in_memory(default_scenes(&ids), known.clone());
            (Arc::new(FakeBackend::new()), Arc::new(probe), scenes)
        } else {
            let backend = GstBackend::new()
                .map_err(|e| anyhow::anyhow!("GStreamer is not usable: {e}"))?;
            let (scenes, report) = SceneManager::open(&config.scenes_file, known.clone())?;
            println!(
                "Loaded {} scene(s) from {}",
                report.installed.len(),
                config.scenes_file.display()
            );
            for (id, reason) in &report.rejected {
                println!("  [WARN] scene '{id}' refused: {reason}");
            }
            (Arc::new(backend), Arc::new(V4l2Probe), scenes)
        };

    let relay = Arc::new(RtspRelay::from_config(&config.relay));
    let ingest = IngestManager::spawn(
        &config.cameras,
        config.ingest.clone(),
        Arc::clone(&backend),
        relay.clone(),
        DeviceRegistry::new(),
    );

    // One synchronous round so cameras with signal stream before the mixer starts.
    let monitor = Arc::new(SignalMonitor::new(&config.cameras, probe, config.signal.clone()));
    for event in monitor.poll_all().await {
        if let Err(e) = ingest.handle_signal(&event).await {
            tracing::warn!(camera = %event.camera_id, error = %e, "Initial signal not applied");
        }
    }
    let streaming = ingest.start_all().await;
    tracing::info!(streaming, "Ingest pipelines up");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(32);
    let listener = ingest.spawn_signal_listener(events_rx);
    let monitor_task = tokio::spawn(Arc::clone(&monitor).run(events_tx, shutdown_rx));

    let mixer = MixerCore::spawn(
        config.mixer.clone(),
        scenes,
        Arc::new(ingest.clone()),
        backend,
        relay,
        config.watchdog.thresholds(),
    );
    if let Some(scene) = &scene {
        mixer
            .set_scene(scene, Transition::Cut)
            .await
            .map_err(|e| anyhow::anyhow!("Cannot select scene '{scene}': {e}"))?;
    }
    if let Err(e) = mixer.start().await {
        tracing::warn!(error = %e, "Mixer did not start; the watchdog will retry");
    }

    let watchdog = Watchdog::new(standard_components(&ingest, &mixer), config.watchdog.clone());
    let watchdog_task = watchdog.spawn();

    let status = mixer.status();
    println!(
        "Mixer {:?} with scene {}",
        status.state,
        status.active_scene.as_deref().unwrap_or("-")
    );
    println!("Press Ctrl+C to stop...");
    println!();

    tokio::signal::ctrl_c().await?;
    println!();
    println!("Shutting down...");

    shutdown_tx.send_replace(true);
    watchdog.shutdown().await;
    if let Err(e) = watchdog_task.await {
        tracing::warn!(error = %e, "Watchdog task failed");
    }
    mixer.shutdown().await;
    ingest.shutdown().await;
    if let Err(e) = monitor_task.await {
        tracing::warn!(error = %e, "Signal monitor task failed");
    }
    // The monitor owned the sender; the listener exits once it is gone.
    if let Err(e) = listener.await {
        tracing::warn!(error = %e, "Signal listener task failed");
    }

    for recovery in watchdog.recovery_statuses() {
        println!(
            "  {:<14} {:<9} recoveries: {}",
            recovery.component,
            recovery.health.to_string(),
            recovery.recoveries
        );
    }
    println!("Stopped.");
    Ok(())
}
