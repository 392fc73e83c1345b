//! Scene transitions.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use scenemix_common::error::{ScenemixError, ScenemixResult};
use scenemix_scene_model::layout::{PadGeometry, ResolvedSlot};
use serde::{Deserialize, Serialize};

/// How the program output moves to a new scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// Immediate swap.
    #[default]
    Cut,
    /// Alpha crossfade over the given duration.
    Mix { duration_ms: u64 },
    /// Crossfade over the configured default duration.
    Auto,
}

impl Transition {
    pub fn mix(duration: Duration) -> Self {
        Self::Mix {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Ramp length; zero for a cut.
    pub fn duration(&self, auto: Duration) -> Duration {
        match self {
            Self::Cut => Duration::ZERO,
            Self::Mix { duration_ms } => Duration::from_millis(*duration_ms),
            Self::Auto => auto,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cut => f.write_str("CUT"),
            Self::Mix { duration_ms } => write!(f, "MIX({duration_ms}ms)"),
            Self::Auto => f.write_str("AUTO"),
        }
    }
}

/// Parses `cut`, `auto` and `mix:<ms>`.
impl FromStr for Transition {
    type Err = ScenemixError;

    fn from_str(s: &str) -> ScenemixResult<Self> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "cut" => Ok(Self::Cut),
            "auto" => Ok(Self::Auto),
            other => {
                let ms = other
                    .strip_prefix("mix:")
                    .and_then(|ms| ms.parse::<u64>().ok())
                    .ok_or_else(|| {
                        ScenemixError::config(format!(
                            "unknown transition '{s}' (expected cut, auto or mix:<ms>)"
                        ))
                    })?;
                Ok(Self::Mix { duration_ms: ms })
            }
        }
    }
}

/// Number of pad updates for a ramp of `duration` at `step` intervals.
pub fn ramp_steps(duration: Duration, step: Duration) -> u32 {
    if duration.is_zero() {
        return 0;
    }
    let step = step.max(Duration::from_millis(1));
    let steps = duration.as_nanos().div_ceil(step.as_nanos());
    steps.clamp(1, u32::MAX as u128) as u32
}

/// Start and end placement of one source across a crossfade.
#[derive(Debug, Clone, PartialEq)]
pub struct PadEndpoints {
    pub source_id: String,
    pub from: PadGeometry,
    pub to: PadGeometry,
}

/// Pair up placements of the current and target scenes.
///
/// Sources in both scenes move between their placements. Entering
/// sources appear at their target placement from transparent; leaving
/// sources fade out where they are.
pub fn crossfade_endpoints(current: &[ResolvedSlot], target: &[ResolvedSlot]) -> Vec<PadEndpoints> {
    let mut endpoints: Vec<PadEndpoints> = target
        .iter()
        .map(|to| {
            let from = current
                .iter()
                .find(|c| c.source_id == to.source_id)
                .map(|c| c.geometry)
                .unwrap_or_else(|| to.geometry.with_alpha(0.0));
            PadEndpoints {
                source_id: to.source_id.clone(),
                from,
                to: to.geometry,
            }
        })
        .collect();

    for leaving in current
        .iter()
        .filter(|c| !target.iter().any(|t| t.source_id == c.source_id))
    {
        endpoints.push(PadEndpoints {
            source_id: leaving.source_id.clone(),
            from: leaving.geometry,
            to: leaving.geometry.with_alpha(0.0),
        });
    }

    endpoints
}

/// Placements at progress `t` in `[0, 1]`.
pub fn frame(endpoints: &[PadEndpoints], t: f64) -> Vec<(String, PadGeometry)> {
    endpoints
        .iter()
        .map(|e| (e.source_id.clone(), PadGeometry::lerp(&e.from, &e.to, t)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: &str, x: u32, alpha: f64) -> ResolvedSlot {
        ResolvedSlot {
            source_id: id.to_string(),
            geometry: PadGeometry {
                x,
                y: 0,
                width: 960,
                height: 1080,
                zorder: 0,
                alpha,
            },
        }
    }

    #[test]
    fn parses_operator_spellings() {
        assert_eq!("CUT".parse::<Transition>().unwrap(), Transition::Cut);
        assert_eq!("auto".parse::<Transition>().unwrap(), Transition::Auto);
        assert_eq!(
            "mix:500".parse::<Transition>().unwrap(),
            Transition::Mix { duration_ms: 500 }
        );
        assert!("wipe".parse::<Transition>().is_err());
    }

    #[test]
    fn serde_uses_a_kind_tag() {
        let json = serde_json::to_string(&Transition::Mix { duration_ms: 250 }).unwrap();
        assert_eq!(json, r#"{"kind":"mix","duration_ms":250}"#);
        let auto: Transition = serde_json::from_str(r#"{"kind":"auto"}"#).unwrap();
        assert_eq!(auto, Transition::Auto);
    }

    #[test]
    fn ramp_steps_round_up() {
        assert_eq!(ramp_steps(Duration::ZERO, Duration::from_millis(40)), 0);
        assert_eq!(ramp_steps(Duration::from_millis(1000), Duration::from_millis(40)), 25);
        assert_eq!(ramp_steps(Duration::from_millis(50), Duration::from_millis(40)), 2);
        assert_eq!(ramp_steps(Duration::from_millis(10), Duration::from_millis(40)), 1);
    }

    #[test]
    fn entering_sources_fade_in_and_leaving_fade_out() {
        let current = vec![slot("cam0", 0, 1.0), slot("cam1", 960, 1.0)];
        let target = vec![slot("cam1", 0, 1.0), slot("cam2", 960, 1.0)];
        let endpoints = crossfade_endpoints(&current, &target);

        let ids: Vec<&str> = endpoints.iter().map(|e| e.source_id.as_str()).collect();
        assert_eq!(ids, ["cam1", "cam2", "cam0"]);

        let start = frame(&endpoints, 0.0);
        assert_eq!(start[0].1.x, 960);
        assert_eq!(start[1].1.alpha, 0.0);
        assert_eq!(start[2].1.alpha, 1.0);

        let mid = frame(&endpoints, 0.5);
        assert_eq!(mid[0].1.x, 480);
        assert!((mid[1].1.alpha - 0.5).abs() < 1e-9);

        let end = frame(&endpoints, 1.0);
        assert_eq!(end[0].1.x, 0);
        assert_eq!(end[1].1.alpha, 1.0);
        assert_eq!(end[2].1.alpha, 0.0);
    }
}
