//! In-process backend serving a seeded demo dataset
//!
//! Every call sleeps for the configured latency and can be made to fail with
//! [`SimulatedBackend::fail_next`]. The mutation helpers stand in for other
//! users acting on the server while the client polls.
//!
//! Tokens carry the user id (`chimera.<user-id>.<nonce>`), so a token issued
//! by one instance resolves in another. Separate CLI processes rely on this.

use super::{Backend, BackendError, BackendResult};
use crate::core_store::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Email of the seeded demo account
pub const DEMO_EMAIL: &str = "demo@chimera.lab";

/// Password of the seeded demo account
pub const DEMO_PASSWORD: &str = "chimera";

/// Id of the seeded demo user
pub const DEMO_USER_ID: &str = "u-demo";

const TOKEN_PREFIX: &str = "chimera.";

struct Account {
    user: User,
    password: String,
}

#[derive(Default)]
struct Dataset {
    accounts: Vec<Account>,
    revoked: HashSet<String>,
    workspaces: Vec<Workspace>,
    conversations: Vec<Conversation>,
    memories: Vec<Memory>,
    invitations: Vec<Invitation>,
    integrations: Vec<Integration>,
}

pub struct SimulatedBackend {
    latency: Duration,
    pending_failures: AtomicUsize,
    calls: Mutex<HashMap<&'static str, usize>>,
    data: Mutex<Dataset>,
}

impl SimulatedBackend {
    /// Backend seeded with the demo dataset and no latency
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            pending_failures: AtomicUsize::new(0),
            calls: Mutex::new(HashMap::new()),
            data: Mutex::new(seed(Utc::now())),
        }
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `n` calls fail with [`BackendError::Unavailable`]
    pub fn fail_next(&self, n: usize) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// How many times `op` was called, including failed calls
    pub fn call_count(&self, op: &str) -> usize {
        self.calls().get(op).copied().unwrap_or(0)
    }

    /// Insert or replace a memory
    pub fn upsert_memory(&self, memory: Memory) {
        let mut data = self.data();
        match data.memories.iter_mut().find(|m| m.id == memory.id) {
            Some(existing) => *existing = memory,
            None => data.memories.push(memory),
        }
    }

    /// Remove a memory. Returns whether it existed.
    pub fn remove_memory(&self, memory_id: &str) -> bool {
        let mut data = self.data();
        let before = data.memories.len();
        data.memories.retain(|m| m.id != memory_id);
        data.memories.len() != before
    }

    /// Append a message to its conversation. Returns false when the
    /// conversation does not exist.
    pub fn push_message(&self, message: Message) -> bool {
        let mut data = self.data();
        match data
            .conversations
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        {
            Some(conversation) => {
                conversation.updated_at = message.timestamp;
                conversation.messages.push(message);
                true
            }
            None => false,
        }
    }

    pub fn add_invitation(&self, invitation: Invitation) {
        self.data().invitations.push(invitation);
    }

    /// Replace a workspace's member list. Returns false when the workspace
    /// does not exist.
    pub fn set_team(&self, workspace_id: &str, members: Vec<TeamMember>) -> bool {
        let mut data = self.data();
        match data.workspaces.iter_mut().find(|w| w.id == workspace_id) {
            Some(workspace) => {
                workspace.members = members;
                workspace.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Remove a workspace. Returns whether it existed.
    pub fn remove_workspace(&self, workspace_id: &str) -> bool {
        let mut data = self.data();
        let before = data.workspaces.len();
        data.workspaces.retain(|w| w.id != workspace_id);
        data.workspaces.len() != before
    }

    async fn enter(&self, op: &'static str) -> BackendResult<()> {
        *self.calls().entry(op).or_insert(0) += 1;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            debug!(op, "Injecting backend failure");
            return Err(BackendError::Unavailable(format!("injected failure in {op}")));
        }
        Ok(())
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<&'static str, usize>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn data(&self) -> MutexGuard<'_, Dataset> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for SimulatedBackend {
    async fn login(&self, email: &str, password: &str) -> BackendResult<AuthSession> {
        self.enter("login").await?;

        let data = self.data();
        let account = data
            .accounts
            .iter()
            .find(|a| a.user.email.eq_ignore_ascii_case(email) && a.password == password)
            .ok_or(BackendError::InvalidCredentials)?;

        let session = AuthSession {
            token: format!("{TOKEN_PREFIX}{}.{}", account.user.id, Uuid::new_v4().simple()),
            refresh: format!("refresh.{}", Uuid::new_v4().simple()),
            user: account.user.clone(),
        };
        info!(user_id = %session.user.id, "Issued session");
        Ok(session)
    }

    async fn logout(&self, token: &str) -> BackendResult<()> {
        self.enter("logout").await?;

        if user_id_of(token).is_none() {
            return Err(BackendError::Unauthorized);
        }
        self.data().revoked.insert(token.to_string());
        Ok(())
    }

    async fn current_user(&self, token: &str) -> BackendResult<User> {
        self.enter("current_user").await?;

        let user_id = user_id_of(token).ok_or(BackendError::Unauthorized)?;
        let data = self.data();
        if data.revoked.contains(token) {
            return Err(BackendError::Unauthorized);
        }
        data.accounts
            .iter()
            .find(|a| a.user.id == user_id)
            .map(|a| a.user.clone())
            .ok_or(BackendError::Unauthorized)
    }

    async fn list_workspaces(&self) -> BackendResult<Vec<Workspace>> {
        self.enter("list_workspaces").await?;
        Ok(self.data().workspaces.clone())
    }

    async fn get_workspace(&self, workspace_id: &str) -> BackendResult<Workspace> {
        self.enter("get_workspace").await?;
        self.data()
            .workspaces
            .iter()
            .find(|w| w.id == workspace_id)
            .cloned()
            .ok_or_else(|| not_found("workspace", workspace_id))
    }

    async fn list_team(&self, workspace_id: &str) -> BackendResult<Vec<TeamMember>> {
        self.enter("list_team").await?;
        self.data()
            .workspaces
            .iter()
            .find(|w| w.id == workspace_id)
            .map(|w| w.members.clone())
            .ok_or_else(|| not_found("workspace", workspace_id))
    }

    async fn list_conversations(&self, workspace_id: &str) -> BackendResult<Vec<Conversation>> {
        self.enter("list_conversations").await?;
        Ok(self
            .data()
            .conversations
            .iter()
            .filter(|c| c.workspace_id == workspace_id)
            .map(|c| Conversation { messages: Vec::new(), ..c.clone() })
            .collect())
    }

    async fn list_messages(&self, conversation_id: &str) -> BackendResult<Vec<Message>> {
        self.enter("list_messages").await?;
        self.data()
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .map(|c| c.messages.clone())
            .ok_or_else(|| not_found("conversation", conversation_id))
    }

    async fn list_memories(&self, workspace_id: &str) -> BackendResult<Vec<Memory>> {
        self.enter("list_memories").await?;
        Ok(self
            .data()
            .memories
            .iter()
            .filter(|m| m.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn list_invitations(&self) -> BackendResult<Vec<Invitation>> {
        self.enter("list_invitations").await?;
        Ok(self.data().invitations.clone())
    }

    async fn list_integrations(&self) -> BackendResult<Vec<Integration>> {
        self.enter("list_integrations").await?;
        Ok(self.data().integrations.clone())
    }
}

fn user_id_of(token: &str) -> Option<&str> {
    let rest = token.strip_prefix(TOKEN_PREFIX)?;
    let (user_id, nonce) = rest.rsplit_once('.')?;
    (!user_id.is_empty() && !nonce.is_empty()).then_some(user_id)
}

fn not_found(kind: &'static str, id: &str) -> BackendError {
    BackendError::NotFound { kind, id: id.to_string() }
}

// -- seed data ----------------------------------------------------------------

fn seed(now: DateTime<Utc>) -> Dataset {
    let days_ago = |d: i64| now - ChronoDuration::days(d);

    let demo = User {
        id: DEMO_USER_ID.to_string(),
        name: "Demo Researcher".to_string(),
        email: DEMO_EMAIL.to_string(),
        avatar: None,
        created_at: days_ago(90),
    };
    let ada = User {
        id: "u-ada".to_string(),
        name: "Ada Lovelace".to_string(),
        email: "ada@chimera.lab".to_string(),
        avatar: None,
        created_at: days_ago(60),
    };

    let member = |id: &str, user_id: &str, ws: &str, role, status| TeamMember {
        id: id.to_string(),
        user_id: user_id.to_string(),
        workspace_id: ws.to_string(),
        role,
        status,
        joined_at: days_ago(30),
    };

    let workspaces = vec![
        Workspace {
            id: "ws-neural".to_string(),
            name: "Neural Nexus".to_string(),
            description: Some("Cross-model reasoning experiments".to_string()),
            owner_id: demo.id.clone(),
            members: vec![
                member("tm-1", &demo.id, "ws-neural", MemberRole::Admin, Presence::Online),
                member("tm-2", &ada.id, "ws-neural", MemberRole::Researcher, Presence::Away),
            ],
            stats: WorkspaceStats {
                total_memories: 2,
                total_embeddings: 48,
                total_conversations: 2,
                system_load: 37,
                last_activity: days_ago(0),
            },
            created_at: days_ago(45),
            updated_at: days_ago(1),
        },
        Workspace {
            id: "ws-quantum".to_string(),
            name: "Quantum Archive".to_string(),
            description: None,
            owner_id: demo.id.clone(),
            members: vec![member("tm-3", &demo.id, "ws-quantum", MemberRole::Admin, Presence::Online)],
            stats: WorkspaceStats {
                total_memories: 1,
                total_embeddings: 12,
                total_conversations: 1,
                system_load: 8,
                last_activity: days_ago(3),
            },
            created_at: days_ago(20),
            updated_at: days_ago(3),
        },
    ];

    let message = |id: &str, conv: &str, role, content: &str, age: i64| Message {
        id: id.to_string(),
        conversation_id: conv.to_string(),
        role,
        content: content.to_string(),
        timestamp: days_ago(age),
        is_pinned: false,
        metadata: None,
    };
    let conversation = |id: &str, ws: &str, title: &str, model: &str, messages: Vec<Message>| {
        Conversation {
            id: id.to_string(),
            workspace_id: ws.to_string(),
            title: title.to_string(),
            model_id: model.to_string(),
            messages,
            injected_memories: Vec::new(),
            status: ConversationStatus::Active,
            created_at: days_ago(10),
            updated_at: days_ago(1),
        }
    };
    let conversations = vec![
        conversation(
            "c-attention",
            "ws-neural",
            "Attention head pruning",
            "gpt-4o",
            vec![
                message("msg-1", "c-attention", MessageRole::User, "Which heads can we prune?", 2),
                message(
                    "msg-2",
                    "c-attention",
                    MessageRole::Assistant,
                    "Heads 3 and 7 contribute least to the loss.",
                    2,
                ),
            ],
        ),
        conversation(
            "c-consolidation",
            "ws-neural",
            "Memory consolidation",
            "claude-3-5-sonnet",
            vec![message("msg-3", "c-consolidation", MessageRole::User, "Summarise last week.", 1)],
        ),
        conversation("c-qubits", "ws-quantum", "Qubit error rates", "gemini-1.5-pro", Vec::new()),
    ];

    let memory = |id: &str, ws: &str, title: &str, content: &str| Memory {
        id: id.to_string(),
        workspace_id: ws.to_string(),
        title: title.to_string(),
        content: content.to_string(),
        snippet: Memory::snippet_of(content),
        tags: vec!["research".to_string()],
        metadata: BTreeMap::new(),
        created_at: days_ago(7),
        updated_at: days_ago(2),
        version: 1,
    };
    let memories = vec![
        memory("m-pruning", "ws-neural", "Pruning results", "Pruning heads 3 and 7 cost 0.2% accuracy."),
        memory("m-lr", "ws-neural", "Learning rate sweep", "Best learning rate was 3e-4 with warmup."),
        memory("m-decoherence", "ws-quantum", "Decoherence notes", "T2 times doubled after shielding."),
    ];

    let invitations = vec![Invitation {
        id: "inv-forge".to_string(),
        workspace_id: "ws-forge".to_string(),
        workspace_name: "Synapse Forge".to_string(),
        inviter_name: ada.name.clone(),
        inviter_email: ada.email.clone(),
        status: InvitationStatus::Pending,
        created_at: days_ago(1),
    }];

    let integration = |id: &str, provider, api_key: &str| Integration {
        id: id.to_string(),
        user_id: demo.id.clone(),
        provider,
        api_key: api_key.to_string(),
        status: IntegrationStatus::Connected,
        last_tested: Some(days_ago(1)),
        error_message: None,
    };
    let integrations = vec![
        integration("int-openai", Provider::OpenAi, "sk-...a1b2"),
        integration("int-anthropic", Provider::Anthropic, "sk-ant-...c3d4"),
    ];

    Dataset {
        accounts: vec![
            Account { user: demo, password: DEMO_PASSWORD.to_string() },
            Account { user: ada, password: "analytical".to_string() },
        ],
        revoked: HashSet::new(),
        workspaces,
        conversations,
        memories,
        invitations,
        integrations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::{memory, message};

    #[tokio::test]
    async fn test_demo_login_and_resolve() {
        let backend = SimulatedBackend::new();
        let session = backend.login(DEMO_EMAIL, DEMO_PASSWORD).await.unwrap();
        assert_eq!(session.user.id, DEMO_USER_ID);

        let user = backend.current_user(&session.token).await.unwrap();
        assert_eq!(user.email, DEMO_EMAIL);
    }

    #[tokio::test]
    async fn test_bad_password_rejected() {
        let backend = SimulatedBackend::new();
        let err = backend.login(DEMO_EMAIL, "wrong").await.unwrap_err();
        assert_eq!(err, BackendError::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_token_resolves_across_instances_until_revoked() {
        let issuer = SimulatedBackend::new();
        let session = issuer.login(DEMO_EMAIL, DEMO_PASSWORD).await.unwrap();

        let other = SimulatedBackend::new();
        assert_eq!(other.current_user(&session.token).await.unwrap().id, DEMO_USER_ID);

        other.logout(&session.token).await.unwrap();
        assert_eq!(
            other.current_user(&session.token).await.unwrap_err(),
            BackendError::Unauthorized
        );
    }

    #[tokio::test]
    async fn test_garbage_token_unauthorized() {
        let backend = SimulatedBackend::new();
        for token in ["", "nope", "chimera.", "chimera.u-demo."] {
            assert_eq!(backend.current_user(token).await.unwrap_err(), BackendError::Unauthorized);
        }
    }

    #[tokio::test]
    async fn test_fail_next_counts_down() {
        let backend = SimulatedBackend::new();
        backend.fail_next(2);

        assert!(backend.list_invitations().await.is_err());
        assert!(backend.list_invitations().await.is_err());
        assert!(backend.list_invitations().await.is_ok());
        assert_eq!(backend.call_count("list_invitations"), 3);
    }

    #[tokio::test]
    async fn test_conversation_list_omits_messages() {
        let backend = SimulatedBackend::new();
        let conversations = backend.list_conversations("ws-neural").await.unwrap();
        assert_eq!(conversations.len(), 2);
        assert!(conversations.iter().all(|c| c.messages.is_empty()));

        let messages = backend.list_messages("c-attention").await.unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn test_mutations_visible_to_reads() {
        let backend = SimulatedBackend::new();

        backend.upsert_memory(memory("m-new", "ws-neural", 1));
        assert!(backend.remove_memory("m-lr"));
        assert!(!backend.remove_memory("m-lr"));
        let ids: Vec<String> = backend
            .list_memories("ws-neural")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m-pruning", "m-new"]);

        assert!(backend.push_message(message("msg-9", "c-qubits")));
        assert!(!backend.push_message(message("msg-10", "c-missing")));
        assert_eq!(backend.list_messages("c-qubits").await.unwrap().len(), 1);

        assert!(backend.set_team("ws-quantum", Vec::new()));
        assert!(backend.list_team("ws-quantum").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_workspace_not_found() {
        let backend = SimulatedBackend::new();
        let err = backend.get_workspace("ws-missing").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound { kind: "workspace", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_applies() {
        let backend = SimulatedBackend::new().with_latency(Duration::from_millis(250));
        let started = tokio::time::Instant::now();
        backend.list_workspaces().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
