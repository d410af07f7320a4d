//! Core utilities shared by the vkframe crates.
//!
//! This crate provides foundational types used across the backend:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - Backend configuration (frames in flight, pool capacities, timeouts)

mod config;
mod error;
mod logging;
mod timer;

pub use config::{BackendConfig, PoolConfig, MAX_FRAMES_IN_FLIGHT};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::FrameTimer;
