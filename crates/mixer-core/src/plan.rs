//! Scene switch planning.

use std::collections::BTreeSet;
use std::fmt;

use scenemix_common::error::{ScenemixError, ScenemixResult};
use scenemix_scene_model::scene::{is_virtual_source, Resolution, Scene};
use serde::Serialize;

use crate::source::{SourceDirectory, SourceInfo};

/// How a scene change is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchPlan {
    /// Rewrite pad properties on the running pipeline.
    InPlace,
    /// Tear down and build a new pipeline.
    Rebuild,
}

impl fmt::Display for SwitchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InPlace => "in-place",
            Self::Rebuild => "rebuild",
        })
    }
}

/// What the running pipeline is wired for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiredSet {
    /// Sources wired to a real stream or virtual generator. Placeholders
    /// standing in for missing cameras are not included.
    pub sources: BTreeSet<String>,
    pub output: Resolution,
}

/// Decide between an in-place update and a rebuild.
///
/// In place iff a pipeline is running, every required source is already
/// wired for real, and the output size is unchanged.
pub fn plan_switch(wired: Option<&WiredSet>, required: &BTreeSet<String>, output: Resolution) -> SwitchPlan {
    match wired {
        Some(w) if w.output == output && required.is_subset(&w.sources) => SwitchPlan::InPlace,
        _ => SwitchPlan::Rebuild,
    }
}

/// What to do when a camera a scene needs is not streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingSourcePolicy {
    /// Refuse the scene (operator requests).
    Reject,
    /// Substitute a black generator (recovery and startup).
    Placeholder,
}

/// Reserved virtual source generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualSource {
    Black,
    Bars,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    Stream(SourceInfo),
    Virtual(VirtualSource),
    /// Missing camera rendered as black.
    Placeholder,
}

/// One compositor input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub source_id: String,
    pub kind: InputKind,
}

impl InputSpec {
    pub fn is_placeholder(&self) -> bool {
        matches!(self.kind, InputKind::Placeholder)
    }
}

/// Map a scene's required sources to compositor inputs, in source-id order.
pub fn resolve_inputs(
    scene: &Scene,
    sources: &dyn SourceDirectory,
    policy: MissingSourcePolicy,
) -> ScenemixResult<Vec<InputSpec>> {
    let mut inputs = Vec::new();
    let mut missing = Vec::new();

    for source_id in scene.required_sources() {
        let kind = if is_virtual_source(&source_id) {
            InputKind::Virtual(if source_id == "bars" {
                VirtualSource::Bars
            } else {
                VirtualSource::Black
            })
        } else if let Some(info) = sources.available(&source_id) {
            InputKind::Stream(info)
        } else {
            match policy {
                MissingSourcePolicy::Reject => {
                    missing.push(source_id);
                    continue;
                }
                MissingSourcePolicy::Placeholder => InputKind::Placeholder,
            }
        };
        inputs.push(InputSpec { source_id, kind });
    }

    if !missing.is_empty() {
        return Err(ScenemixError::device_unavailable(
            missing.join(","),
            format!("not streaming; scene '{}' needs it", scene.id),
        ));
    }
    Ok(inputs)
}
