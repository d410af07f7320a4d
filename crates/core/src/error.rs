//! Error types shared by the vkframe crates.

use thiserror::Error;

/// Main error type for configuration and setup failures.
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors while reading configuration files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed configuration files
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration values out of range
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;
