//! SceneMix Watchdog
//!
//! Periodically classifies the health of the mixer and every ingest
//! pipeline from their published snapshots, and drives recovery of
//! components that are UNHEALTHY or FAILED.
//!
//! # Recovery
//!
//! ```text
//!  DETECTING ──▶ DRAINING ──▶ RELEASED ──▶ REBUILDING ──▶ VERIFYING ──▶ HEALTHY
//!      │            (EOS, then     (settle)     (last known        │
//!      │             forced stop)                 good)             └──▶ FAILED
//!      └── already healthy: abort                                     (backoff, cap)
//! ```
//!
//! Ticks only read snapshots; each recovery runs on its own task.

pub mod recovery;
pub mod supervised;
pub mod watchdog;

pub use recovery::*;
pub use supervised::*;
pub use watchdog::*;
