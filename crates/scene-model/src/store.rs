//! Persisted scene catalog (`scenes.json`).
//!
//! The store file is the only persisted state of the mixer: scene
//! definitions plus the id of the last scene that reached PLAYING, which
//! the watchdog reapplies during recovery.

use std::path::{Path, PathBuf};

use scenemix_common::error::{ScenemixError, ScenemixResult};
use serde::{Deserialize, Serialize};

use crate::scene::{KnownSources, Scene, Slot};

/// On-disk document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneDocument {
    /// Schema version.
    #[serde(default = "schema_version")]
    pub version: String,

    /// Last modified timestamp (ISO 8601).
    #[serde(default)]
    pub modified_at: String,

    #[serde(default)]
    pub scenes: Vec<Scene>,

    /// Scene id reapplied on recovery.
    #[serde(default)]
    pub last_known_good: Option<String>,
}

fn schema_version() -> String {
    "1.0".to_string()
}

/// Outcome of loading a store file.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Scene ids installed.
    pub installed: Vec<String>,
    /// Scene ids refused, with the reason.
    pub rejected: Vec<(String, String)>,
    /// Whether the defaults were seeded because no file existed.
    pub seeded_defaults: bool,
}

/// Validated scene catalog with optional backing file.
#[derive(Debug, Clone)]
pub struct SceneStore {
    path: Option<PathBuf>,
    scenes: Vec<Scene>,
    last_known_good: Option<String>,
}

impl SceneStore {
    /// In-memory store (tests, dry runs).
    pub fn in_memory(scenes: Vec<Scene>, known: &KnownSources) -> (Self, LoadReport) {
        let mut store = Self {
            path: None,
            scenes: Vec::new(),
            last_known_good: None,
        };
        let report = store.install_all(scenes, known);
        (store, report)
    }

    /// Load the store at `path`. A missing file is seeded with default
    /// scenes for the known cameras and written back.
    ///
    /// Scenes that fail validation are refused individually and reported;
    /// they are never installed.
    pub fn load(path: impl AsRef<Path>, known: &KnownSources) -> ScenemixResult<(Self, LoadReport)> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let cameras: Vec<&str> = known.cameras().collect();
            let (mut store, mut report) = Self::in_memory(default_scenes(&cameras), known);
            store.path = Some(path);
            store.save()?;
            report.seeded_defaults = true;
            tracing::info!(
                path = %store.path_display(),
                scenes = report.installed.len(),
                "Seeded default scene catalog"
            );
            return Ok((store, report));
        }

        let content = std::fs::read_to_string(&path)?;
        let document: SceneDocument = serde_json::from_str(&content)?;

        let mut store = Self {
            path: Some(path),
            scenes: Vec::new(),
            last_known_good: None,
        };
        let report = store.install_all(document.scenes, known);
        store.last_known_good = document
            .last_known_good
            .filter(|id| store.get(id).is_some());

        for (id, reason) in &report.rejected {
            tracing::warn!(scene = %id, %reason, "Scene refused at load");
        }

        Ok((store, report))
    }

    /// Write the store back to its file, if it has one.
    pub fn save(&self) -> ScenemixResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let document = SceneDocument {
            version: schema_version(),
            modified_at: chrono::Utc::now().to_rfc3339(),
            scenes: self.scenes.clone(),
            last_known_good: self.last_known_good.clone(),
        };
        let json = serde_json::to_string_pretty(&document)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    pub fn get(&self, id: &str) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.id == id)
    }

    pub fn last_known_good(&self) -> Option<&str> {
        self.last_known_good.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert a new scene. Fails if the id exists or validation fails.
    pub fn insert(&mut self, scene: Scene, known: &KnownSources) -> ScenemixResult<()> {
        scene.validate(known)?;
        if self.get(&scene.id).is_some() {
            return Err(ScenemixError::scene_rejected(
                &scene.id,
                "a scene with this id already exists",
            ));
        }
        self.scenes.push(scene);
        Ok(())
    }

    /// Replace an existing scene in place, keeping its catalog position.
    pub fn replace(&mut self, id: &str, scene: Scene, known: &KnownSources) -> ScenemixResult<()> {
        if scene.id != id {
            return Err(ScenemixError::scene_rejected(
                id,
                format!("update may not rename the scene to '{}'", scene.id),
            ));
        }
        scene.validate(known)?;
        let slot = self
            .scenes
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ScenemixError::not_found("scene", id))?;
        *slot = scene;
        Ok(())
    }

    /// Remove a scene; clears the last-known-good reference if it pointed here.
    pub fn remove(&mut self, id: &str) -> ScenemixResult<Scene> {
        let idx = self
            .scenes
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| ScenemixError::not_found("scene", id))?;
        if self.last_known_good.as_deref() == Some(id) {
            self.last_known_good = None;
        }
        Ok(self.scenes.remove(idx))
    }

    pub fn set_last_known_good(&mut self, id: &str) -> ScenemixResult<bool> {
        if self.get(id).is_none() {
            return Err(ScenemixError::not_found("scene", id));
        }
        if self.last_known_good.as_deref() == Some(id) {
            return Ok(false);
        }
        self.last_known_good = Some(id.to_string());
        Ok(true)
    }

    fn install_all(&mut self, scenes: Vec<Scene>, known: &KnownSources) -> LoadReport {
        let mut report = LoadReport::default();
        for scene in scenes {
            let id = scene.id.clone();
            match self.insert(scene, known) {
                Ok(()) => report.installed.push(id),
                Err(e) => report.rejected.push((id, e.to_string())),
            }
        }
        report
    }

    fn path_display(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<memory>".to_string())
    }
}

/// Default catalog for a camera list: one full-frame scene per camera,
/// `dual`, `pip`, `quad` where enough cameras exist, and `black`.
pub fn default_scenes(cameras: &[&str]) -> Vec<Scene> {
    let mut scenes: Vec<Scene> = cameras
        .iter()
        .map(|cam| Scene::new(format!("single-{cam}"), format!("{cam} full frame"), vec![Slot::full(*cam)]))
        .collect();

    if let [a, b, ..] = cameras {
        scenes.push(Scene::new(
            "dual",
            "Side by side",
            vec![
                Slot::new(*a, 0.0, 0.0, 0.5, 1.0),
                Slot::new(*b, 0.5, 0.0, 0.5, 1.0),
            ],
        ));
        scenes.push(Scene::new(
            "pip",
            "Picture in picture",
            vec![
                Slot::full(*a),
                Slot::new(*b, 0.68, 0.66, 0.3, 0.3).with_z(1),
            ],
        ));
    }

    if cameras.len() >= 3 {
        let cells = [(0.0, 0.0), (0.5, 0.0), (0.0, 0.5), (0.5, 0.5)];
        let slots = cameras
            .iter()
            .zip(cells)
            .map(|(cam, (x, y))| Slot::new(*cam, x, y, 0.5, 0.5))
            .collect();
        scenes.push(Scene::new("quad", "2x2 grid", slots));
    }

    scenes.push(Scene::new("black", "Black", vec![Slot::full("black")]));
    scenes
}
