//! Domain entities shared by the backend, the stores and the refreshers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Anything held in a store collection that refreshers can diff
pub trait Entity {
    /// Stable identifier
    fn entity_id(&self) -> &str;

    /// Monotonic marker that changes whenever the entity changes
    fn revision(&self) -> i64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Tokens and user returned by a successful login
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: String,
    pub refresh: String,
    pub user: User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Researcher,
    Observer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Away,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub role: MemberRole,
    pub status: Presence,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStats {
    pub total_memories: u32,
    pub total_embeddings: u32,
    pub total_conversations: u32,
    /// 0-100
    pub system_load: u8,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub owner_id: String,
    pub members: Vec<TeamMember>,
    pub stats: WorkspaceStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Workspace {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> i64 {
        self.updated_at.timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Entity for Message {
    fn entity_id(&self) -> &str {
        &self.id
    }

    /// Pinning is the only in-place edit the product allows
    fn revision(&self) -> i64 {
        self.timestamp.timestamp_millis() * 2 + i64::from(self.is_pinned)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectedMemory {
    pub id: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Completed,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub workspace_id: String,
    pub title: String,
    pub model_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub injected_memories: Vec<InjectedMemory>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Conversation {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> i64 {
        self.updated_at.timestamp_millis()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: String,
    pub workspace_id: String,
    pub title: String,
    pub content: String,
    pub snippet: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u32,
}

impl Memory {
    /// Length of the snippet shown on memory cards
    pub const SNIPPET_LEN: usize = 150;

    /// First [`Self::SNIPPET_LEN`] characters of `content`
    pub fn snippet_of(content: &str) -> String {
        content.chars().take(Self::SNIPPET_LEN).collect()
    }
}

impl Entity for Memory {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> i64 {
        i64::from(self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub id: String,
    pub workspace_id: String,
    pub workspace_name: String,
    pub inviter_name: String,
    pub inviter_email: String,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
}

impl Entity for Invitation {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> i64 {
        match self.status {
            InvitationStatus::Pending => 0,
            InvitationStatus::Accepted => 1,
            InvitationStatus::Declined => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    DeepSeek,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    Connected,
    Error,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    /// Masked key as returned by the backend
    pub api_key: String,
    pub status: IntegrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tested: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
