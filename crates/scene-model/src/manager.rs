//! Thread-safe scene catalog shared by the mixer and the control layer.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use scenemix_common::error::{ScenemixError, ScenemixResult};

use crate::layout::{resolve, ResolvedSlot};
use crate::scene::{KnownSources, Resolution, Scene};
use crate::store::{LoadReport, SceneStore};

/// Owns the scene catalog and performs coordinate resolution.
///
/// Cloning yields another handle to the same catalog. Every mutation is
/// validated first and persisted before it becomes visible; a failed save
/// leaves the catalog unchanged.
#[derive(Clone)]
pub struct SceneManager {
    inner: Arc<RwLock<Inner>>,
}

struct Inner {
    store: SceneStore,
    known: KnownSources,
}

impl SceneManager {
    pub fn new(store: SceneStore, known: KnownSources) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner { store, known })),
        }
    }

    /// Load (or seed) the store file and wrap it.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        known: KnownSources,
    ) -> ScenemixResult<(Self, LoadReport)> {
        let (store, report) = SceneStore::load(path, &known)?;
        Ok((Self::new(store, known), report))
    }

    /// In-memory manager with the given scenes; invalid ones are dropped.
    pub fn in_memory(scenes: Vec<Scene>, known: KnownSources) -> Self {
        let (store, report) = SceneStore::in_memory(scenes, &known);
        for (id, reason) in report.rejected {
            tracing::warn!(scene = %id, %reason, "Scene refused");
        }
        Self::new(store, known)
    }

    pub fn list(&self) -> Vec<Scene> {
        self.read().store.scenes().to_vec()
    }

    pub fn get(&self, id: &str) -> ScenemixResult<Scene> {
        self.read()
            .store
            .get(id)
            .cloned()
            .ok_or_else(|| ScenemixError::not_found("scene", id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().store.get(id).is_some()
    }

    pub fn create(&self, scene: Scene) -> ScenemixResult<()> {
        let id = scene.id.clone();
        self.mutate(|store, known| store.insert(scene, known))?;
        tracing::info!(scene = %id, "Scene created");
        Ok(())
    }

    pub fn update(&self, id: &str, scene: Scene) -> ScenemixResult<()> {
        self.mutate(|store, known| store.replace(id, scene, known))?;
        tracing::info!(scene = %id, "Scene updated");
        Ok(())
    }

    pub fn delete(&self, id: &str) -> ScenemixResult<Scene> {
        let removed = self.mutate(|store, _| store.remove(id))?;
        tracing::info!(scene = %id, "Scene deleted");
        Ok(removed)
    }

    /// Resolve a stored scene against an output frame.
    pub fn resolve(&self, id: &str, output: Resolution) -> ScenemixResult<Vec<ResolvedSlot>> {
        let scene = self.get(id)?;
        Ok(resolve(&scene, output))
    }

    pub fn last_known_good(&self) -> Option<String> {
        self.read().store.last_known_good().map(str::to_string)
    }

    /// Record `id` as the scene to reapply on recovery.
    pub fn mark_last_known_good(&self, id: &str) -> ScenemixResult<()> {
        {
            let inner = self.read();
            if inner.store.last_known_good() == Some(id) {
                return Ok(());
            }
        }
        self.mutate(|store, _| store.set_last_known_good(id).map(|_| ()))
    }

    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut SceneStore, &KnownSources) -> ScenemixResult<T>,
    ) -> ScenemixResult<T> {
        let mut inner = self.write();
        let Inner { store, known } = &mut *inner;
        let mut staged = store.clone();
        let out = op(&mut staged, known)?;
        staged.save()?;
        *store = staged;
        Ok(out)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Slot;
    use crate::store::default_scenes;

    fn manager() -> SceneManager {
        SceneManager::in_memory(
            default_scenes(&["cam0", "cam1", "cam2"]),
            KnownSources::new(["cam0", "cam1", "cam2"]),
        )
    }

    #[test]
    fn crud_round() {
        let scenes = manager();
        let count = scenes.list().len();

        let wide = Scene::new(
            "wide",
            "Wide",
            vec![Slot::full("cam2"), Slot::new("cam0", 0.7, 0.7, 0.25, 0.25).with_z(1)],
        );
        scenes.create(wide.clone()).unwrap();
        assert_eq!(scenes.list().len(), count + 1);
        assert!(scenes.create(wide).is_err());

        let mut changed = scenes.get("wide").unwrap();
        changed.slots[1].alpha = 0.5;
        scenes.update("wide", changed).unwrap();
        assert_eq!(scenes.get("wide").unwrap().slots[1].alpha, 0.5);

        scenes.delete("wide").unwrap();
        assert!(!scenes.contains("wide"));
        assert!(matches!(
            scenes.get("wide"),
            Err(ScenemixError::NotFound { .. })
        ));
    }

    #[test]
    fn invalid_update_leaves_scene_untouched() {
        let scenes = manager();
        let before = scenes.get("dual").unwrap();
        let mut broken = before.clone();
        broken.slots[0].source_id = "cam3".to_string();
        let err = scenes.update("dual", broken).unwrap_err();
        assert!(err.to_string().contains("unknown source 'cam3'"));
        assert_eq!(scenes.get("dual").unwrap(), before);
    }

    #[test]
    fn resolve_by_id() {
        let scenes = manager();
        let slots = scenes.resolve("dual", Resolution::FULL_HD).unwrap();
        assert_eq!(slots[1].geometry.x, 960);
        assert!(scenes.resolve("missing", Resolution::FULL_HD).is_err());
    }

    #[test]
    fn last_known_good_tracks_existing_scenes_only() {
        let scenes = manager();
        assert_eq!(scenes.last_known_good(), None);
        scenes.mark_last_known_good("pip").unwrap();
        assert_eq!(scenes.last_known_good().as_deref(), Some("pip"));
        assert!(scenes.mark_last_known_good("nope").is_err());
        scenes.delete("pip").unwrap();
        assert_eq!(scenes.last_known_good(), None);
    }
}
