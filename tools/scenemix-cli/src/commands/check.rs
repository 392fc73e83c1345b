//! Probe configured cameras.

use std::sync::Arc;

use scenemix_common::config::AppConfig;
use scenemix_ingest_engine::{SignalMonitor, V4l2Probe};

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    println!("SceneMix Camera Check");
    println!("{}", "=".repeat(50));

    if config.cameras.is_empty() {
        println!("[WARN] No cameras configured");
        return Ok(());
    }

    let monitor = SignalMonitor::new(&config.cameras, Arc::new(V4l2Probe), config.signal.clone());

    let mut with_signal = 0;
    for camera in &config.cameras {
        let label = format!("{} ({})", camera.id, camera.device_path.display());
        if !camera.enabled {
            println!("[SKIP] {label}: disabled");
            continue;
        }
        let reading = monitor.poll(&camera.id).await;
        match reading.size() {
            Some(size) => {
                with_signal += 1;
                println!("[OK]   {label}: signal {size} ({:?})", camera.codec);
            }
            None if camera.device_path.exists() => println!("[WARN] {label}: no signal"),
            None => println!("[FAIL] {label}: device node missing"),
        }
    }

    println!();
    println!(
        "{with_signal} of {} enabled camera(s) have signal.",
        config.enabled_cameras().count()
    );
    println!("Relay: {}", config.relay.base_url);

    Ok(())
}
