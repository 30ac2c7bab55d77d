//! Remote API seam
//!
//! The client only talks to the server through [`Backend`]. The product has
//! no real server, so [`SimulatedBackend`] serves a seeded dataset instead.

pub mod simulated;

pub use simulated::SimulatedBackend;

use crate::core_store::types::{
    AuthSession, Conversation, Integration, Invitation, Memory, Message, TeamMember, User,
    Workspace,
};
use async_trait::async_trait;
use thiserror::Error;

/// Result type for backend calls
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors returned by backend calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The token is unknown or has been revoked
    #[error("Unauthorized")]
    Unauthorized,

    /// Email and password did not match an account
    #[error("Invalid email or password")]
    InvalidCredentials,

    /// The requested resource does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The server could not be reached or failed
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Async view of the remote API
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn login(&self, email: &str, password: &str) -> BackendResult<AuthSession>;

    /// Revoke `token` server-side
    async fn logout(&self, token: &str) -> BackendResult<()>;

    /// Resolve the user a token belongs to
    async fn current_user(&self, token: &str) -> BackendResult<User>;

    async fn list_workspaces(&self) -> BackendResult<Vec<Workspace>>;

    async fn get_workspace(&self, workspace_id: &str) -> BackendResult<Workspace>;

    async fn list_team(&self, workspace_id: &str) -> BackendResult<Vec<TeamMember>>;

    /// Conversations of a workspace, without their messages
    async fn list_conversations(&self, workspace_id: &str) -> BackendResult<Vec<Conversation>>;

    async fn list_messages(&self, conversation_id: &str) -> BackendResult<Vec<Message>>;

    async fn list_memories(&self, workspace_id: &str) -> BackendResult<Vec<Memory>>;

    async fn list_invitations(&self) -> BackendResult<Vec<Invitation>>;

    async fn list_integrations(&self) -> BackendResult<Vec<Integration>>;
}
