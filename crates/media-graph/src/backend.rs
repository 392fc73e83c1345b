//! Backend-neutral pipeline contract.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scenemix_common::error::ScenemixResult;
use serde::Serialize;
use tokio::time::Instant;

use crate::graph::PipelineGraph;

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Null => "NULL",
            Self::Ready => "READY",
            Self::Paused => "PAUSED",
            Self::Playing => "PLAYING",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusSeverity {
    Warning,
    Error,
    Eos,
}

/// An asynchronous message posted on a pipeline bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusEvent {
    pub severity: BusSeverity,
    /// Posting element: its name, or its `/`-separated path inside the
    /// pipeline when the backend knows it (`"pipeline"` for EOS).
    pub element: String,
    pub message: String,
    pub debug: Option<String>,
}

impl BusEvent {
    pub fn warning(element: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: BusSeverity::Warning,
            element: element.into(),
            message: message.into(),
            debug: None,
        }
    }

    pub fn error(element: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: BusSeverity::Error,
            element: element.into(),
            message: message.into(),
            debug: None,
        }
    }

    pub fn eos() -> Self {
        Self {
            severity: BusSeverity::Eos,
            element: "pipeline".to_string(),
            message: "end of stream".to_string(),
            debug: None,
        }
    }
}

/// Compositor sink pad properties written on live scene changes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PadProperties {
    pub xpos: i32,
    pub ypos: i32,
    pub width: i32,
    pub height: i32,
    pub zorder: u32,
    pub alpha: f64,
}

impl PadProperties {
    /// Fully transparent, zero-area placement for wired but unused inputs.
    pub fn hidden() -> Self {
        Self {
            xpos: 0,
            ypos: 0,
            width: 1,
            height: 1,
            zorder: 0,
            alpha: 0.0,
        }
    }
}

/// A built pipeline.
///
/// Every state change is explicit and bounded: `set_state` returns a
/// [`ScenemixError::StateTransitionTimeout`] instead of blocking when the
/// target state is not reached in time.
///
/// [`ScenemixError::StateTransitionTimeout`]: scenemix_common::error::ScenemixError::StateTransitionTimeout
#[async_trait]
pub trait MediaPipeline: Send + Sync {
    fn name(&self) -> &str;

    /// Last state the pipeline confirmed.
    fn state(&self) -> PipelineState;

    /// Request `target` and wait up to `timeout` for it.
    async fn set_state(&self, target: PipelineState, timeout: Duration) -> ScenemixResult<()>;

    /// Send end-of-stream and wait for it to reach the sinks.
    async fn drain(&self, timeout: Duration) -> ScenemixResult<()>;

    /// Write sink pad properties on a named element (compositor).
    fn set_pad(&self, element: &str, pad: &str, props: &PadProperties) -> ScenemixResult<()>;

    /// Bus messages posted since the last call.
    fn take_bus_events(&self) -> Vec<BusEvent>;

    /// When the last buffer passed the activity tap.
    fn last_activity(&self) -> Option<Instant>;
}

/// Builds pipelines from graphs.
pub trait PipelineBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Instantiate `graph`. The pipeline is returned in [`PipelineState::Null`].
    fn build(&self, graph: &PipelineGraph) -> ScenemixResult<Arc<dyn MediaPipeline>>;
}
