//! Error types for core_client module

use crate::config::ConfigError;
use crate::core_backend::BackendError;
use crate::core_realtime::RealtimeError;
use crate::core_session::StorageError;
use thiserror::Error;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by [`ChimeraClient`](super::ChimeraClient)
#[derive(Error, Debug)]
pub enum ClientError {
    /// Backend call failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Credential storage could not be read or written
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Polling could not be started
    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    /// Configuration rejected at construction
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// Whether the error means the credentials are no good
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Backend(BackendError::Unauthorized | BackendError::InvalidCredentials)
        )
    }
}
