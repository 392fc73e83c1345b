//! SceneMix Mixer Core
//!
//! Maintains the single compositing pipeline that realizes the active
//! scene. Scene changes whose sources are already wired only rewrite
//! compositor pad properties; anything else tears the pipeline down and
//! rebuilds it with exactly the sources the scene needs.
//!
//! # Scene application
//!
//! ```text
//!  set_scene(id) ──▶ coordinator queue ──▶ coalesce ──▶ plan_switch
//!                                                        │
//!                              ┌─────────────────────────┴──────┐
//!                              ▼                                ▼
//!                        InPlace: pad ramp              Rebuild: NULL → READY
//!                        (geometry, alpha)              → PLAYING (bounded)
//! ```

pub mod mixer;
pub mod pipeline;
pub mod plan;
pub mod source;
pub mod transition;

pub use mixer::*;
pub use plan::*;
pub use source::*;
pub use transition::*;
