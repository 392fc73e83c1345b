//! SceneMix Common Utilities
//!
//! Shared infrastructure for all SceneMix crates:
//! - Error taxonomy and result aliases
//! - Monotonic activity stamps and retry backoff
//! - Health classification shared by the mixer, ingest, and watchdog
//! - Tracing/logging initialization
//! - Configuration loading and validation

pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use health::*;
