//! Resolution of normalized slots to absolute pixel geometry.

use serde::{Deserialize, Serialize};

use crate::scene::{Resolution, Scene};

/// A slot resolved against a concrete output frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSlot {
    pub source_id: String,
    pub geometry: PadGeometry,
}

/// Absolute placement of one compositor input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PadGeometry {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Dense rank, unique per scene; higher renders on top.
    pub zorder: u32,
    pub alpha: f64,
}

impl PadGeometry {
    /// Interpolate between two placements. Position and size round to the
    /// nearest pixel; zorder switches at the midpoint.
    pub fn lerp(a: &PadGeometry, b: &PadGeometry, t: f64) -> PadGeometry {
        let t = t.clamp(0.0, 1.0);
        let mix = |from: u32, to: u32| (from as f64 + (to as f64 - from as f64) * t).round() as u32;
        PadGeometry {
            x: mix(a.x, b.x),
            y: mix(a.y, b.y),
            width: mix(a.width, b.width).max(1),
            height: mix(a.height, b.height).max(1),
            zorder: if t < 0.5 { a.zorder } else { b.zorder },
            alpha: a.alpha + (b.alpha - a.alpha) * t,
        }
    }

    /// Same placement at a different opacity.
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha.clamp(0.0, 1.0);
        self
    }

    /// Right edge (exclusive).
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Bottom edge (exclusive).
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

/// Resolve `scene` against an `output` frame.
///
/// `abs = round(rel * size)`, then clamped so each slot lies inside the
/// frame and covers at least one pixel. Slots keep definition order; the
/// `zorder` field is the slot's rank by `(z_order, definition index)`, so
/// with equal `z_order` the later-defined slot renders on top.
pub fn resolve(scene: &Scene, output: Resolution) -> Vec<ResolvedSlot> {
    let out_w = output.width.max(1);
    let out_h = output.height.max(1);

    let mut order: Vec<usize> = (0..scene.slots.len()).collect();
    order.sort_by_key(|&idx| (scene.slots[idx].z_order, idx));
    let mut ranks = vec![0u32; scene.slots.len()];
    for (rank, idx) in order.into_iter().enumerate() {
        ranks[idx] = rank as u32;
    }

    scene
        .slots
        .iter()
        .zip(ranks)
        .map(|(slot, zorder)| {
            let (x, width) = resolve_axis(slot.x_rel, slot.w_rel, out_w);
            let (y, height) = resolve_axis(slot.y_rel, slot.h_rel, out_h);
            ResolvedSlot {
                source_id: slot.source_id.clone(),
                geometry: PadGeometry {
                    x,
                    y,
                    width,
                    height,
                    zorder,
                    alpha: slot.alpha.clamp(0.0, 1.0),
                },
            }
        })
        .collect()
}

fn resolve_axis(offset_rel: f64, size_rel: f64, total: u32) -> (u32, u32) {
    let scale = |v: f64| {
        let v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        (v * total as f64).round() as u32
    };
    let offset = scale(offset_rel).min(total - 1);
    let size = scale(size_rel).clamp(1, total - offset);
    (offset, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{KnownSources, Slot};
    use proptest::prelude::*;

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
    fn dual_scene_at_full_hd() {
        let slots = resolve(&dual(), Resolution::new(1920, 1080));
        assert_eq!(slots[0].source_id, "cam0");
        assert_eq!(
            (slots[0].geometry.x, slots[0].geometry.y, slots[0].geometry.width, slots[0].geometry.height),
            (0, 0, 960, 1080)
        );
        assert_eq!(slots[1].source_id, "cam1");
        assert_eq!(
            (slots[1].geometry.x, slots[1].geometry.y, slots[1].geometry.width, slots[1].geometry.height),
            (960, 0, 960, 1080)
        );
    }

    #[test]
    fn equal_z_order_later_slot_on_top() {
        let scene = Scene::new(
            "overlap",
            "Overlap",
            vec![
                Slot::new("cam0", 0.0, 0.0, 1.0, 1.0),
                Slot::new("cam1", 0.1, 0.1, 0.3, 0.3),
                Slot::new("cam2", 0.2, 0.2, 0.3, 0.3).with_z(-1),
            ],
        );
        let slots = resolve(&scene, Resolution::FULL_HD);
        assert_eq!(slots[2].geometry.zorder, 0);
        assert_eq!(slots[0].geometry.zorder, 1);
        assert_eq!(slots[1].geometry.zorder, 2);
    }

    #[test]
    fn tiny_output_still_yields_positive_area() {
        let slots = resolve(&dual(), Resolution::new(1, 1));
        for slot in slots {
            assert!(slot.geometry.width >= 1 && slot.geometry.height >= 1);
            assert!(slot.geometry.right() <= 1 && slot.geometry.bottom() <= 1);
        }
    }

    #[test]
    fn lerp_midpoint() {
        let a = PadGeometry {
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
            zorder: 0,
            alpha: 1.0,
        };
        let b = PadGeometry {
            x: 960,
            y: 540,
            width: 960,
            height: 540,
            zorder: 3,
            alpha: 0.0,
        };
        let mid = PadGeometry::lerp(&a, &b, 0.5);
        assert_eq!((mid.x, mid.y, mid.width, mid.height), (480, 270, 1440, 810));
        assert_eq!(mid.zorder, 3);
        assert!((mid.alpha - 0.5).abs() < 1e-9);
        assert_eq!(PadGeometry::lerp(&a, &b, -1.0), a);
    }

    fn arb_slot(source: &'static str) -> impl Strategy<Value = Slot> {
        (0.0f64..1.0, 0.0f64..1.0, 0.01f64..1.0, 0.01f64..1.0, -3i32..3, 0.0f64..=1.0).prop_map(
            move |(x, y, w, h, z, alpha)| {
                let w = w.min(1.0 - x).max(0.01);
                let h = h.min(1.0 - y).max(0.01);
                let x = x.min(1.0 - w);
                let y = y.min(1.0 - h);
                Slot::new(source, x, y, w, h).with_z(z).with_alpha(alpha)
            },
        )
    }

    proptest! {
        #[test]
        fn valid_scenes_resolve_within_bounds(
            a in arb_slot("cam0"),
            b in arb_slot("cam1"),
            width in 1u32..4096,
            height in 1u32..4096,
        ) {
            let scene = Scene::new("p", "prop", vec![a, b]);
            let known = KnownSources::new(["cam0", "cam1"]);
            prop_assume!(scene.validate(&known).is_ok());

            let slots = resolve(&scene, Resolution::new(width, height));
            prop_assert_eq!(slots.len(), 2);
            let mut zorders: Vec<u32> = slots.iter().map(|s| s.geometry.zorder).collect();
            zorders.sort_unstable();
            prop_assert_eq!(zorders, vec![0, 1]);
            for slot in &slots {
                let g = slot.geometry;
                prop_assert!(g.width >= 1 && g.height >= 1);
                prop_assert!(g.right() <= width);
                prop_assert!(g.bottom() <= height);
            }
        }
    }
}
