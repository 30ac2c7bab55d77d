//! Test fixtures for creating common test objects
//!
//! Factory functions for domain entities. Timestamps
//! are fixed so that equality-based change detection is deterministic.

use crate::core_store::types::*;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;

/// Fixed instant `offset_secs` after the fixture epoch
pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap()
}

pub fn user(id: &str) -> User {
    User {
        id: id.to_string(),
        name: format!("User {id}"),
        email: format!("{id}@chimera.lab"),
        avatar: None,
        created_at: at(0),
    }
}

pub fn workspace(id: &str) -> Workspace {
    Workspace {
        id: id.to_string(),
        name: format!("Workspace {id}"),
        description: None,
        owner_id: "u-1".to_string(),
        members: Vec::new(),
        stats: WorkspaceStats {
            total_memories: 0,
            total_embeddings: 0,
            total_conversations: 0,
            system_load: 10,
            last_activity: at(0),
        },
        created_at: at(0),
        updated_at: at(0),
    }
}

pub fn team_member(id: &str, workspace_id: &str) -> TeamMember {
    TeamMember {
        id: id.to_string(),
        user_id: format!("user-{id}"),
        workspace_id: workspace_id.to_string(),
        role: MemberRole::Researcher,
        status: Presence::Online,
        joined_at: at(0),
    }
}

pub fn conversation(id: &str, workspace_id: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        workspace_id: workspace_id.to_string(),
        title: format!("Conversation {id}"),
        model_id: "gpt-4o".to_string(),
        messages: Vec::new(),
        injected_memories: Vec::new(),
        status: ConversationStatus::Active,
        created_at: at(0),
        updated_at: at(0),
    }
}

pub fn message(id: &str, conversation_id: &str) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        role: MessageRole::User,
        content: format!("message {id}"),
        timestamp: at(0),
        is_pinned: false,
        metadata: None,
    }
}

pub fn memory(id: &str, workspace_id: &str, version: u32) -> Memory {
    let content = format!("Memory {id} content v{version}");
    Memory {
        id: id.to_string(),
        workspace_id: workspace_id.to_string(),
        title: format!("Memory {id}"),
        snippet: Memory::snippet_of(&content),
        content,
        tags: vec!["test".to_string()],
        metadata: BTreeMap::new(),
        created_at: at(0),
        updated_at: at(i64::from(version)),
        version,
    }
}

pub fn invitation(id: &str) -> Invitation {
    Invitation {
        id: id.to_string(),
        workspace_id: "ws-invite".to_string(),
        workspace_name: "Quantum Lab".to_string(),
        inviter_name: "Ada".to_string(),
        inviter_email: "ada@chimera.lab".to_string(),
        status: InvitationStatus::Pending,
        created_at: at(0),
    }
}

pub fn integration(id: &str, provider: Provider) -> Integration {
    Integration {
        id: id.to_string(),
        user_id: "u-1".to_string(),
        provider,
        api_key: "sk-...1234".to_string(),
        status: IntegrationStatus::Connected,
        last_tested: None,
        error_message: None,
    }
}
