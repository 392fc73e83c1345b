//! Scene and slot types with load-time validation.
//!
//! A scene is only ever installed after [`Scene::validate`] accepts it, so
//! every other crate can treat an installed scene as resolvable.

use std::collections::{BTreeSet, HashSet};

use scenemix_common::config::{CameraConfig, RESERVED_SOURCES};
use scenemix_common::error::{ScenemixError, ScenemixResult};
use serde::{Deserialize, Serialize};

/// Slack allowed on `x + w <= 1` for values typed as decimals (0.1 + 0.9).
const EDGE_EPSILON: f64 = 1e-6;

/// Output frame size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const FULL_HD: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::FULL_HD
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One source's placement within a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    /// Camera id or reserved virtual source.
    pub source_id: String,

    /// Left edge (normalized).
    pub x_rel: f64,
    /// Top edge (normalized).
    pub y_rel: f64,
    /// Width (normalized).
    pub w_rel: f64,
    /// Height (normalized).
    pub h_rel: f64,

    /// Stacking order; higher renders on top. Ties go to the later slot.
    #[serde(default)]
    pub z_order: i32,

    /// Opacity in `[0.0, 1.0]`.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

fn default_alpha() -> f64 {
    1.0
}

impl Slot {
    pub fn new(source_id: impl Into<String>, x: f64, y: f64, w: f64, h: f64) -> Self {
        Self {
            source_id: source_id.into(),
            x_rel: x,
            y_rel: y,
            w_rel: w,
            h_rel: h,
            z_order: 0,
            alpha: 1.0,
        }
    }

    /// Full-frame slot.
    pub fn full(source_id: impl Into<String>) -> Self {
        Self::new(source_id, 0.0, 0.0, 1.0, 1.0)
    }

    pub fn with_z(mut self, z_order: i32) -> Self {
        self.z_order = z_order;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }
}

/// A named layout mapping sources to normalized screen regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,

    /// Human-readable label for operator surfaces.
    #[serde(default)]
    pub label: String,

    /// Output resolution this scene is authored for.
    #[serde(default)]
    pub resolution: Resolution,

    /// Slots in definition order.
    pub slots: Vec<Slot>,
}

impl Scene {
    pub fn new(id: impl Into<String>, label: impl Into<String>, slots: Vec<Slot>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            resolution: Resolution::default(),
            slots,
        }
    }

    /// Distinct sources this scene pulls, sorted.
    pub fn required_sources(&self) -> BTreeSet<String> {
        self.slots.iter().map(|s| s.source_id.clone()).collect()
    }

    /// Camera sources only (virtual sources never need ingest).
    pub fn camera_sources(&self) -> BTreeSet<String> {
        self.slots
            .iter()
            .filter(|s| !is_virtual_source(&s.source_id))
            .map(|s| s.source_id.clone())
            .collect()
    }

    /// Check every invariant an installed scene must hold.
    pub fn validate(&self, known: &KnownSources) -> ScenemixResult<()> {
        let reject = |reason: String| Err(ScenemixError::scene_rejected(&self.id, reason));

        if self.id.trim().is_empty() {
            return Err(ScenemixError::scene_rejected("", "scene id must not be empty"));
        }
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return reject(format!("output resolution {} has zero area", self.resolution));
        }
        if self.slots.is_empty() {
            return reject("scene has no slots".to_string());
        }

        let mut seen = HashSet::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            if !known.contains(&slot.source_id) {
                return reject(format!(
                    "slot {idx} references unknown source '{}' (known: {})",
                    slot.source_id,
                    known.describe()
                ));
            }
            if !seen.insert(slot.source_id.as_str()) {
                return reject(format!(
                    "source '{}' is placed more than once",
                    slot.source_id
                ));
            }

            for (name, value) in [
                ("x_rel", slot.x_rel),
                ("y_rel", slot.y_rel),
                ("w_rel", slot.w_rel),
                ("h_rel", slot.h_rel),
                ("alpha", slot.alpha),
            ] {
                if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                    return reject(format!(
                        "slot {idx} ({}) has {name}={value}, expected [0, 1]",
                        slot.source_id
                    ));
                }
            }

            if slot.x_rel + slot.w_rel > 1.0 + EDGE_EPSILON
                || slot.y_rel + slot.h_rel > 1.0 + EDGE_EPSILON
            {
                return reject(format!(
                    "slot {idx} ({}) extends past the frame edge",
                    slot.source_id
                ));
            }

            let width = (slot.w_rel * self.resolution.width as f64).round();
            let height = (slot.h_rel * self.resolution.height as f64).round();
            if width < 1.0 || height < 1.0 {
                return reject(format!(
                    "slot {idx} ({}) resolves to zero area at {}",
                    slot.source_id, self.resolution
                ));
            }
        }

        Ok(())
    }
}

/// Set of source ids a scene may reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownSources {
    cameras: BTreeSet<String>,
}

impl KnownSources {
    pub fn new(camera_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            cameras: camera_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// All configured cameras, enabled or not; a disabled camera is still a
    /// valid scene reference, it is just never available.
    pub fn from_cameras(cameras: &[CameraConfig]) -> Self {
        Self::new(cameras.iter().map(|c| c.id.clone()))
    }

    pub fn contains(&self, source_id: &str) -> bool {
        is_virtual_source(source_id) || self.cameras.contains(source_id)
    }

    pub fn cameras(&self) -> impl Iterator<Item = &str> {
        self.cameras.iter().map(String::as_str)
    }

    fn describe(&self) -> String {
        self.cameras
            .iter()
            .map(String::as_str)
            .chain(RESERVED_SOURCES.iter().copied())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Whether `source_id` is a reserved virtual source.
pub fn is_virtual_source(source_id: &str) -> bool {
    RESERVED_SOURCES.contains(&source_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> KnownSources {
        KnownSources::new(["cam0", "cam1", "cam2", "cam3"])
    }

    fn dual() -> Scene {
        Scene::new(
            "dual",
            "Side by side",
            vec![
                Slot::new("cam0", 0.0, 0.0, 0.5, 1.0),
                Slot::new("cam1", 0.5, 0.0, 0.5, 1.0),
            ],
        )
    }

    #[test]
    fn valid_scene_passes() {
        dual().validate(&known()).unwrap();
    }

    #[test]
    fn unknown_source_is_refused_with_reason() {
        let mut scene = dual();
        scene.slots[1].source_id = "cam7".to_string();
        let err = scene.validate(&known()).unwrap_err().to_string();
        assert!(err.contains("unknown source 'cam7'"), "{err}");
        assert!(err.contains("dual"));
    }

    #[test]
    fn virtual_sources_are_always_known() {
        let scene = Scene::new("blank", "Blank", vec![Slot::full("black")]);
        scene.validate(&KnownSources::new(Vec::<String>::new())).unwrap();
        assert!(scene.camera_sources().is_empty());
    }

    #[test]
    fn out_of_range_and_overflowing_slots_are_rejected() {
        let mut scene = dual();
        scene.slots[0].alpha = 1.5;
        assert!(scene.validate(&known()).is_err());

        let mut scene = dual();
        scene.slots[1].x_rel = 0.6;
        let err = scene.validate(&known()).unwrap_err().to_string();
        assert!(err.contains("past the frame edge"));

        let mut scene = dual();
        scene.slots[0].w_rel = f64::NAN;
        assert!(scene.validate(&known()).is_err());
    }

    #[test]
    fn zero_area_slot_is_rejected_at_load() {
        let mut scene = dual();
        scene.slots[0].w_rel = 0.0001;
        let err = scene.validate(&known()).unwrap_err().to_string();
        assert!(err.contains("zero area"), "{err}");
    }

    #[test]
    fn duplicate_sources_are_rejected() {
        let mut scene = dual();
        scene.slots[1].source_id = "cam0".to_string();
        let err = scene.validate(&known()).unwrap_err().to_string();
        assert!(err.contains("more than once"));
    }

    #[test]
    fn decimal_edges_within_epsilon_are_accepted() {
        let scene = Scene::new(
            "thirds",
            "Thirds",
            vec![
                Slot::new("cam0", 0.0, 0.0, 0.1, 1.0),
                Slot::new("cam1", 0.1, 0.0, 0.9, 1.0),
            ],
        );
        scene.validate(&known()).unwrap();
    }

    #[test]
    fn slot_defaults_when_omitted() {
        let slot: Slot = serde_json::from_str(
            r#"{ "source_id": "cam0", "x_rel": 0, "y_rel": 0, "w_rel": 1, "h_rel": 1 }"#,
        )
        .unwrap();
        assert_eq!(slot.z_order, 0);
        assert_eq!(slot.alpha, 1.0);
    }
}
