//! Poll keys, one per data domain and scope

pub const WORKSPACES: &str = "workspaces";
pub const INVITATIONS: &str = "invitations";
pub const INTEGRATIONS: &str = "integrations";

pub fn workspace(workspace_id: &str) -> String {
    format!("workspace:{workspace_id}")
}

pub fn conversations(workspace_id: &str) -> String {
    format!("conversations:{workspace_id}")
}

pub fn messages(conversation_id: &str) -> String {
    format!("messages:{conversation_id}")
}

pub fn memories(workspace_id: &str) -> String {
    format!("memories:{workspace_id}")
}

pub fn team(workspace_id: &str) -> String {
    format!("team:{workspace_id}")
}
