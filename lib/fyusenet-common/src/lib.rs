//! Shared error taxonomy, timing instrumentation and configuration plumbing used by every
//! FyuseNet crate. Nothing in here is GPU- or layer-specific; see `fyusenet-gpu` and
//! `fyusenet-base` for the pieces that are.

pub mod config;
pub mod error;
pub mod performance;

pub use config::EngineConfig;
pub use error::{FyuseNetError, Result};
pub use performance::PerformanceTracker;
