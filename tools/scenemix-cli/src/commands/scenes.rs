//! Inspect and validate the scene catalog.

use std::path::PathBuf;

use scenemix_common::config::AppConfig;
use scenemix_scene_model::manager::SceneManager;
use scenemix_scene_model::scene::{KnownSources, Resolution};
use scenemix_scene_model::store::SceneStore;

fn open_catalog(config: &AppConfig) -> anyhow::Result<SceneManager> {
    let known = KnownSources::from_cameras(&config.cameras);
    let (manager, report) = SceneManager::open(&config.scenes_file, known)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", config.scenes_file.display()))?;
    if report.seeded_defaults {
        println!(
            "Seeded default scenes at {}\n",
            config.scenes_file.display()
        );
    }
    Ok(manager)
}

pub fn list(config: AppConfig) -> anyhow::Result<()> {
    let manager = open_catalog(&config)?;
    let last_known_good = manager.last_known_good();

    println!("Scenes in {}", config.scenes_file.display());
    for scene in manager.list() {
        let marker = if last_known_good.as_deref() == Some(scene.id.as_str()) {
            " (last known good)"
        } else {
            ""
        };
        let sources: Vec<String> = scene.required_sources().into_iter().collect();
        println!(
            "  {:<14} {:<24} {}  [{}]{marker}",
            scene.id,
            scene.label,
            scene.resolution,
            sources.join(", ")
        );
    }
    Ok(())
}

pub fn resolve(
    config: AppConfig,
    id: String,
    width: Option<u32>,
    height: Option<u32>,
) -> anyhow::Result<()> {
    let manager = open_catalog(&config)?;
    let scene = manager.get(&id)?;
    let output = Resolution::new(
        width.unwrap_or(scene.resolution.width),
        height.unwrap_or(scene.resolution.height),
    );
    let slots = manager.resolve(&id, output)?;

    println!("Scene '{id}' at {output}");
    println!(
        "  {:<8} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6}",
        "source", "x", "y", "width", "height", "zorder", "alpha"
    );
    for slot in &slots {
        let g = &slot.geometry;
        println!(
            "  {:<8} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6.2}",
            slot.source_id, g.x, g.y, g.width, g.height, g.zorder, g.alpha
        );
    }
    Ok(())
}

pub fn validate(config: AppConfig, file: PathBuf) -> anyhow::Result<()> {
    println!("Validating scenes at: {}", file.display());
    if !file.exists() {
        anyhow::bail!("{} does not exist", file.display());
    }

    let known = KnownSources::from_cameras(&config.cameras);
    let (store, report) = SceneStore::load(&file, &known)
        .map_err(|e| anyhow::anyhow!("Failed to load scenes: {e}"))?;

    println!("  Installed: {}", report.installed.join(", "));
    if let Some(id) = store.last_known_good() {
        println!("  Last known good: {id}");
    }

    if report.rejected.is_empty() {
        println!("\nAll {} scene(s) are valid.", report.installed.len());
        return Ok(());
    }

    println!("\nRejected scenes:");
    for (id, reason) in &report.rejected {
        println!("  - {id}: {reason}");
    }
    anyhow::bail!("{} scene(s) rejected", report.rejected.len())
}
