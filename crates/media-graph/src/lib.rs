//! SceneMix Media Graph
//!
//! Pipeline topology is described as a typed [`graph::PipelineGraph`] and
//! only compiled to a GStreamer launch description at the backend boundary.
//! Everything above this crate (ingest, mixer, watchdog) talks to the
//! [`backend::PipelineBackend`] and [`backend::MediaPipeline`] traits, so it
//! can be exercised against the in-process [`fake::FakeBackend`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   build(graph)   ┌─────────────────────┐
//! │ PipelineGraph│ ───────────────▶ │ PipelineBackend     │
//! │  Element/Caps│                  │  GstBackend         │
//! └──────────────┘                  │  FakeBackend        │
//!        ▲                          └──────────┬──────────┘
//!        │ publish/subscribe nodes             │
//! ┌──────┴───────┐                  ┌──────────▼──────────┐
//! │ MediaRelay   │                  │ MediaPipeline       │
//! │  RtspRelay   │                  │  state / bus / pads │
//! └──────────────┘                  └─────────────────────┘
//! ```

pub mod backend;
pub mod fake;
pub mod graph;
pub mod gst_backend;
pub mod relay;

pub use backend::*;
pub use graph::*;
pub use relay::*;
