//! Configuration error types

use thiserror::Error;

/// Errors raised while loading, validating or saving [`super::Config`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    FileReadError(String),

    #[error("Failed to write configuration file: {0}")]
    FileWriteError(String),

    /// The file is not valid TOML for this schema
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to serialize configuration: {0}")]
    SerializeError(String),

    /// An environment override could not be parsed
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// The values parsed but break a constraint (zero interval, bad level)
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}
