//! Realtime event definitions
//!
//! Every event carried by the [`EventBus`](super::EventBus) has one of a fixed
//! set of types. The wire names (`"memory:created"`, ...) are what the
//! frontend listens for, so they are the serde representation as well.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Type of a realtime event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "workspace:updated")]
    WorkspaceUpdated,
    #[serde(rename = "workspace:deleted")]
    WorkspaceDeleted,
    #[serde(rename = "conversation:created")]
    ConversationCreated,
    #[serde(rename = "conversation:updated")]
    ConversationUpdated,
    #[serde(rename = "conversation:deleted")]
    ConversationDeleted,
    #[serde(rename = "message:created")]
    MessageCreated,
    #[serde(rename = "message:updated")]
    MessageUpdated,
    #[serde(rename = "message:deleted")]
    MessageDeleted,
    #[serde(rename = "memory:created")]
    MemoryCreated,
    #[serde(rename = "memory:updated")]
    MemoryUpdated,
    #[serde(rename = "memory:deleted")]
    MemoryDeleted,
    #[serde(rename = "team:updated")]
    TeamUpdated,
    #[serde(rename = "invitation:received")]
    InvitationReceived,
}

impl EventType {
    /// All event types, in declaration order
    pub const ALL: [EventType; 13] = [
        EventType::WorkspaceUpdated,
        EventType::WorkspaceDeleted,
        EventType::ConversationCreated,
        EventType::ConversationUpdated,
        EventType::ConversationDeleted,
        EventType::MessageCreated,
        EventType::MessageUpdated,
        EventType::MessageDeleted,
        EventType::MemoryCreated,
        EventType::MemoryUpdated,
        EventType::MemoryDeleted,
        EventType::TeamUpdated,
        EventType::InvitationReceived,
    ];

    /// Wire name of the event type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkspaceUpdated => "workspace:updated",
            EventType::WorkspaceDeleted => "workspace:deleted",
            EventType::ConversationCreated => "conversation:created",
            EventType::ConversationUpdated => "conversation:updated",
            EventType::ConversationDeleted => "conversation:deleted",
            EventType::MessageCreated => "message:created",
            EventType::MessageUpdated => "message:updated",
            EventType::MessageDeleted => "message:deleted",
            EventType::MemoryCreated => "memory:created",
            EventType::MemoryUpdated => "memory:updated",
            EventType::MemoryDeleted => "memory:deleted",
            EventType::TeamUpdated => "team:updated",
            EventType::InvitationReceived => "invitation:received",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not a known event type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// An event delivered through the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

impl RealtimeEvent {
    /// Create an event stamped with the current time
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
            timestamp: Utc::now(),
            workspace_id: None,
        }
    }

    /// Scope the event to a workspace
    pub fn in_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }
}
