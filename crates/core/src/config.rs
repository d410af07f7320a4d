//! Backend configuration, loaded from `vkframe.toml` or built in code.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Upper bound on frames in flight supported by the backend.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Top-level backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Number of frame slots, each with its own fence, semaphores and
    /// command list. Must be in `1..=MAX_FRAMES_IN_FLIGHT`.
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: usize,
    /// How long a frame slot fence wait may block before the frame fails
    /// with a timeout, in milliseconds. Zero waits forever.
    #[serde(default = "default_fence_timeout_ms")]
    pub fence_timeout_ms: u64,
    /// Emit debug marker commands into replayed command buffers.
    #[serde(default = "default_true")]
    pub debug_markers: bool,
    /// Prefer FIFO presentation over mailbox.
    #[serde(default)]
    pub vsync: bool,
    /// Time each frame on the GPU with per-slot timestamp queries.
    #[serde(default)]
    pub gpu_timestamps: bool,
    /// Binding-set pool capacities.
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Fixed per-category capacities of every binding-set pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Binding sets per pool
    #[serde(default = "default_max_sets")]
    pub max_sets: u32,
    /// Uniform buffer bindings per pool, applied to static and dynamic
    /// uniform buffers separately
    #[serde(default = "default_uniform_buffers")]
    pub uniform_buffers: u32,
    /// Combined image/sampler bindings per pool
    #[serde(default = "default_sampled_images")]
    pub sampled_images: u32,
    /// Storage buffer bindings per pool
    #[serde(default = "default_storage_buffers")]
    pub storage_buffers: u32,
    /// Storage image bindings per pool
    #[serde(default = "default_storage_images")]
    pub storage_images: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: default_frames_in_flight(),
            fence_timeout_ms: default_fence_timeout_ms(),
            debug_markers: true,
            vsync: false,
            gpu_timestamps: false,
            pool: PoolConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sets: default_max_sets(),
            uniform_buffers: default_uniform_buffers(),
            sampled_images: default_sampled_images(),
            storage_buffers: default_storage_buffers(),
            storage_images: default_storage_images(),
        }
    }
}

impl BackendConfig {
    /// Parses a configuration from TOML text and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] for malformed TOML and [`Error::Config`] for
    /// out-of-range values.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        info!("Loaded backend configuration from {}", path.display());
        Ok(config)
    }

    /// Loads a configuration file, falling back to defaults when the file is
    /// missing or invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Using default backend configuration ({}): {}",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Checks that every value is within the range the backend supports.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(Error::Config(format!(
                "frames_in_flight must be between 1 and {}, got {}",
                MAX_FRAMES_IN_FLIGHT, self.frames_in_flight
            )));
        }
        self.pool.validate(self.frames_in_flight)
    }

    /// Fence timeout in nanoseconds, as expected by the native wait call.
    pub fn fence_timeout_ns(&self) -> u64 {
        if self.fence_timeout_ms == 0 {
            u64::MAX
        } else {
            self.fence_timeout_ms.saturating_mul(1_000_000)
        }
    }
}

impl PoolConfig {
    /// Every binding set allocates one native set per frame slot, so a pool
    /// must hold at least that many.
    fn validate(&self, frames_in_flight: usize) -> Result<()> {
        if (self.max_sets as usize) < frames_in_flight {
            return Err(Error::Config(format!(
                "pool.max_sets ({}) must be at least frames_in_flight ({})",
                self.max_sets, frames_in_flight
            )));
        }
        if self.uniform_buffers == 0 && self.sampled_images == 0 && self.storage_buffers == 0 {
            return Err(Error::Config(
                "pool capacities must allow at least one binding category".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_frames_in_flight() -> usize {
    2
}

fn default_fence_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_max_sets() -> u32 {
    128
}

fn default_uniform_buffers() -> u32 {
    256
}

fn default_sampled_images() -> u32 {
    256
}

fn default_storage_buffers() -> u32 {
    128
}

fn default_storage_images() -> u32 {
    128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BackendConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.pool.max_sets, 128);
        assert_eq!(config.pool.uniform_buffers, 256);
        assert_eq!(config.pool.sampled_images, 256);
        assert_eq!(config.pool.storage_buffers, 128);
        assert_eq!(config.pool.storage_images, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = BackendConfig::from_toml(
            r#"
            frames_in_flight = 3

            [pool]
            max_sets = 64
            "#,
        )
        .expect("valid config");
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.pool.max_sets, 64);
        assert_eq!(config.pool.uniform_buffers, 256);
        assert_eq!(config.fence_timeout_ms, 5_000);
        assert!(!config.gpu_timestamps);
    }

    #[test]
    fn test_rejects_too_many_frames() {
        let err = BackendConfig::from_toml("frames_in_flight = 4").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_zero_frames() {
        let config = BackendConfig {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_pool_smaller_than_frame_count() {
        let mut config = BackendConfig::default();
        config.pool.max_sets = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml() {
        let err = BackendConfig::from_toml("frames_in_flight = \"two\"").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_fence_timeout_conversion() {
        let mut config = BackendConfig::default();
        assert_eq!(config.fence_timeout_ns(), 5_000_000_000);
        config.fence_timeout_ms = 0;
        assert_eq!(config.fence_timeout_ns(), u64::MAX);
    }

    #[test]
    fn test_load_missing_file_falls_back() {
        let config = BackendConfig::load_or_default("/nonexistent/vkframe.toml");
        assert_eq!(config, BackendConfig::default());
    }
}
