//! SceneMix Scene Model
//!
//! Defines the data contracts for mixer scenes:
//! - **Scene:** a named layout of sources over an output resolution
//! - **Layout:** resolution of normalized slots to absolute pixel geometry
//! - **Store:** the persisted catalog plus the last-known-good reference
//! - **Manager:** thread-safe list/get/create/update/delete over the store
//!
//! Slot coordinates are normalized to `[0.0, 1.0]` relative to the output
//! frame so one scene works at any output resolution.

pub mod layout;
pub mod manager;
pub mod scene;
pub mod store;

pub use layout::*;
pub use manager::*;
pub use scene::*;
pub use store::*;
