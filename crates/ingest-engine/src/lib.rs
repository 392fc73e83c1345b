//! SceneMix Ingest Engine
//!
//! Owns every capture device. Each enabled camera gets one always-on
//! capture→encode→publish pipeline, driven by a coordinator task, and every
//! consumer (mixer, recorder, preview) subscribes to the published stream
//! instead of opening the device.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐ SignalEvent ┌──────────────────────────────────┐
//! │ SignalMonitor │ ──────────▶ │          IngestManager           │
//! │  DeviceProbe  │             │  ┌────────────┐  ┌────────────┐  │
//! └───────────────┘             │  │ cam0 task  │  │ cam1 task  │  │
//!                               │  └─────┬──────┘  └─────┬──────┘  │
//!                               │        │ DeviceLease   │         │
//!                               └────────┼───────────────┼─────────┘
//!                                        ▼               ▼
//!                               ┌──────────────────────────────────┐
//!                               │   MediaRelay (rtsp://…/camN)     │
//!                               └──────────────────────────────────┘
//! ```

pub mod device;
pub mod manager;
pub mod pipeline;
pub mod signal;

pub use device::*;
pub use manager::*;
pub use signal::*;
