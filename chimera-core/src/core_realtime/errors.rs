//! Error types for core_realtime module

use crate::core_backend::BackendError;
use std::time::Duration;
use thiserror::Error;

/// Result type for realtime operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Errors raised by poll operations and the registry
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// The backend call behind a refresh failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// A poll run did not finish within the fetch timeout
    #[error("Fetch for {key} timed out after {after:?}")]
    Timeout { key: String, after: Duration },

    /// A poll interval of zero was requested
    #[error("Invalid poll interval for {key}: interval must be greater than zero")]
    InvalidInterval { key: String },

    /// Any other fetch failure reported by a custom operation
    #[error("Fetch failed: {0}")]
    Fetch(String),
}
