//! Data store snapshots and the stale-result guard
//!
//! All slices live behind one lock. A reset replaces every slice in a single
//! write, so a reader never sees one user's workspaces next to another
//! user's (or an empty) memory bank.
//!
//! Fetch results go through a [`FetchTicket`]. A result is applied only if
//! no reset happened since the fetch began and no newer fetch for the same
//! poll key has been applied already.

use super::types::{
    Conversation, Integration, Invitation, InvitationStatus, Memory, Message, TeamMember, User,
    Workspace,
};
use metrics::counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// A store slice with an initial shape it can be reset to
pub trait StoreSlice: Default {
    const NAME: &'static str;

    /// Replace the entire slice with its initial shape
    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthState {
    pub user: Option<User>,
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl StoreSlice for AuthState {
    const NAME: &'static str = "auth";
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceState {
    pub workspaces: Vec<Workspace>,
    pub active_workspace_id: Option<String>,
    pub previous_workspace_id: Option<String>,
    pub is_transitioning: bool,
    pub transition_progress: u8,
    pub is_loading: bool,
}

impl StoreSlice for WorkspaceState {
    const NAME: &'static str = "workspace";
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatState {
    pub conversations: Vec<Conversation>,
    pub active_conversation_id: Option<String>,
    pub auto_store: bool,
    pub is_loading: bool,
}

impl Default for ChatState {
    fn default() -> Self {
        Self {
            conversations: Vec::new(),
            active_conversation_id: None,
            auto_store: true,
            is_loading: false,
        }
    }
}

impl StoreSlice for ChatState {
    const NAME: &'static str = "chat";
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemorySort {
    #[default]
    Recent,
    Title,
    Relevance,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryState {
    pub memories: Vec<Memory>,
    pub search_query: String,
    pub sort_by: MemorySort,
    pub selected_memory_id: Option<String>,
    pub is_loading: bool,
}

impl StoreSlice for MemoryState {
    const NAME: &'static str = "memory";
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvitationState {
    pub invitations: Vec<Invitation>,
    pub is_loading: bool,
}

impl InvitationState {
    pub fn pending_count(&self) -> usize {
        self.invitations
            .iter()
            .filter(|inv| inv.status == InvitationStatus::Pending)
            .count()
    }
}

impl StoreSlice for InvitationState {
    const NAME: &'static str = "invitation";
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegrationState {
    pub integrations: Vec<Integration>,
    pub is_loading: bool,
}

impl StoreSlice for IntegrationState {
    const NAME: &'static str = "integration";
}

/// Every slice, as one consistent value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub auth: AuthState,
    pub workspace: WorkspaceState,
    pub chat: ChatState,
    pub memory: MemoryState,
    pub invitation: InvitationState,
    pub integration: IntegrationState,
}

impl StoreSnapshot {
    /// Whether every slice is in its initial shape
    pub fn is_initial(&self) -> bool {
        *self == StoreSnapshot::default()
    }

    fn reset(&mut self) {
        self.auth.reset();
        self.workspace.reset();
        self.chat.reset();
        self.memory.reset();
        self.invitation.reset();
        self.integration.reset();
    }
}

/// Slice selector for loading flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDomain {
    Auth,
    Workspace,
    Chat,
    Memory,
    Invitation,
    Integration,
}

impl StoreDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreDomain::Auth => AuthState::NAME,
            StoreDomain::Workspace => WorkspaceState::NAME,
            StoreDomain::Chat => ChatState::NAME,
            StoreDomain::Memory => MemoryState::NAME,
            StoreDomain::Invitation => InvitationState::NAME,
            StoreDomain::Integration => IntegrationState::NAME,
        }
    }
}

/// Proof of when a fetch began
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
    seq: u64,
}

impl FetchTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Result of applying a fetch result
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome<T> {
    /// The store changed; carries what it held before
    Applied(T),
    /// The result matched what the store already held
    Unchanged,
    /// The result was dropped: a reset or a newer fetch won
    Stale,
}

impl<T> ApplyOutcome<T> {
    pub fn is_stale(&self) -> bool {
        matches!(self, ApplyOutcome::Stale)
    }
}

struct Inner {
    snapshot: StoreSnapshot,
    generation: u64,
    applied: HashMap<String, u64>,
}

/// Container for every client-side data store
pub struct DataStores {
    inner: RwLock<Inner>,
    next_seq: AtomicU64,
}

impl DataStores {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                snapshot: StoreSnapshot::default(),
                generation: 0,
                applied: HashMap::new(),
            }),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Consistent copy of every slice
    pub fn snapshot(&self) -> StoreSnapshot {
        self.read_inner().snapshot.clone()
    }

    /// Borrow the slices under the read lock
    pub fn read<R>(&self, f: impl FnOnce(&StoreSnapshot) -> R) -> R {
        f(&self.read_inner().snapshot)
    }

    /// Number of resets so far
    pub fn generation(&self) -> u64 {
        self.read_inner().generation
    }

    /// Record the start of a fetch
    pub fn begin_fetch(&self) -> FetchTicket {
        // Sequence is taken under the read lock so it is ordered after any
        // reset that already happened.
        let inner = self.read_inner();
        FetchTicket {
            generation: inner.generation,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Whether a result for `ticket` would still be accepted under `key`
    pub fn is_current(&self, ticket: FetchTicket, key: &str) -> bool {
        let inner = self.read_inner();
        ticket.generation == inner.generation
            && ticket.seq > inner.applied.get(key).copied().unwrap_or(0)
    }

    /// Replace every slice with its initial shape in one write
    ///
    /// Safe to call any number of times. Every outstanding ticket becomes
    /// stale.
    pub fn reset_all(&self) {
        let mut inner = self.write_inner();
        inner.snapshot.reset();
        inner.generation += 1;
        inner.applied.clear();
        let generation = inner.generation;
        drop(inner);

        counter!("chimera_store_resets_total").increment(1);
        info!(generation, "Reset all data stores");
    }

    /// Toggle a loading flag, unless the ticket predates a reset
    pub fn set_loading(&self, ticket: FetchTicket, domain: StoreDomain, loading: bool) {
        let mut inner = self.write_inner();
        if inner.generation != ticket.generation {
            return;
        }
        let s = &mut inner.snapshot;
        match domain {
            StoreDomain::Auth => s.auth.is_loading = loading,
            StoreDomain::Workspace => s.workspace.is_loading = loading,
            StoreDomain::Chat => s.chat.is_loading = loading,
            StoreDomain::Memory => s.memory.is_loading = loading,
            StoreDomain::Invitation => s.invitation.is_loading = loading,
            StoreDomain::Integration => s.integration.is_loading = loading,
        }
    }

    // -- auth ---------------------------------------------------------------

    pub fn set_authenticated(&self, user: User) {
        let mut inner = self.write_inner();
        inner.snapshot.auth = AuthState {
            user: Some(user),
            is_authenticated: true,
            is_loading: false,
            error: None,
        };
    }

    pub fn set_auth_error(&self, message: impl Into<String>) {
        let mut inner = self.write_inner();
        let auth = &mut inner.snapshot.auth;
        auth.error = Some(message.into());
        auth.is_loading = false;
    }

    pub fn current_user(&self) -> Option<User> {
        self.read(|s| s.auth.user.clone())
    }

    // -- selection ----------------------------------------------------------

    /// Make `workspace_id` the active workspace, remembering the previous one
    pub fn set_active_workspace(&self, workspace_id: Option<String>) {
        let mut inner = self.write_inner();
        let ws = &mut inner.snapshot.workspace;
        if ws.active_workspace_id != workspace_id {
            ws.previous_workspace_id = ws.active_workspace_id.take();
            ws.active_workspace_id = workspace_id;
        }
    }

    pub fn set_active_conversation(&self, conversation_id: Option<String>) {
        self.write_inner().snapshot.chat.active_conversation_id = conversation_id;
    }

    /// Search settings used by the memory refresher
    pub fn set_memory_query(&self, query: impl Into<String>, sort_by: MemorySort) {
        let mut inner = self.write_inner();
        inner.snapshot.memory.search_query = query.into();
        inner.snapshot.memory.sort_by = sort_by;
    }

    // -- fetch results ------------------------------------------------------

    pub fn apply_workspaces(
        &self,
        ticket: FetchTicket,
        key: &str,
        workspaces: Vec<Workspace>,
    ) -> ApplyOutcome<Vec<Workspace>> {
        self.apply(ticket, key, |s| {
            replace_if_changed(&mut s.workspace.workspaces, workspaces)
        })
    }

    /// Upsert a single workspace
    pub fn apply_workspace(
        &self,
        ticket: FetchTicket,
        key: &str,
        workspace: Workspace,
    ) -> ApplyOutcome<Option<Workspace>> {
        self.apply(ticket, key, |s| {
            let list = &mut s.workspace.workspaces;
            match list.iter_mut().find(|w| w.id == workspace.id) {
                Some(existing) if *existing == workspace => ApplyOutcome::Unchanged,
                Some(existing) => {
                    ApplyOutcome::Applied(Some(std::mem::replace(existing, workspace)))
                }
                None => {
                    list.push(workspace);
                    ApplyOutcome::Applied(None)
                }
            }
        })
    }

    /// Replace the member list of one workspace
    pub fn apply_team(
        &self,
        ticket: FetchTicket,
        key: &str,
        workspace_id: &str,
        members: Vec<TeamMember>,
    ) -> ApplyOutcome<Vec<TeamMember>> {
        self.apply(ticket, key, |s| {
            match s.workspace.workspaces.iter_mut().find(|w| w.id == workspace_id) {
                Some(workspace) => replace_if_changed(&mut workspace.members, members),
                None => ApplyOutcome::Stale,
            }
        })
    }

    /// Replace the conversations of one workspace
    ///
    /// Conversation lists come without messages; messages already loaded for
    /// a conversation are carried over.
    pub fn apply_conversations(
        &self,
        ticket: FetchTicket,
        key: &str,
        workspace_id: &str,
        conversations: Vec<Conversation>,
    ) -> ApplyOutcome<Vec<Conversation>> {
        self.apply(ticket, key, |s| {
            let all = &mut s.chat.conversations;
            let previous: Vec<Conversation> = all
                .iter()
                .filter(|c| c.workspace_id == workspace_id)
                .cloned()
                .collect();

            let mut incoming = conversations;
            for conversation in incoming.iter_mut() {
                if conversation.messages.is_empty() {
                    if let Some(old) = previous.iter().find(|c| c.id == conversation.id) {
                        conversation.messages = old.messages.clone();
                    }
                }
            }

            if incoming == previous {
                return ApplyOutcome::Unchanged;
            }
            all.retain(|c| c.workspace_id != workspace_id);
            all.extend(incoming);
            ApplyOutcome::Applied(previous)
        })
    }

    /// Replace the messages of one conversation
    ///
    /// Messages for a conversation the chat store does not know are dropped.
    pub fn apply_messages(
        &self,
        ticket: FetchTicket,
        key: &str,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> ApplyOutcome<Vec<Message>> {
        self.apply(ticket, key, |s| {
            match s.chat.conversations.iter_mut().find(|c| c.id == conversation_id) {
                Some(conversation) => replace_if_changed(&mut conversation.messages, messages),
                None => ApplyOutcome::Stale,
            }
        })
    }

    /// Replace the memories of one workspace
    pub fn apply_memories(
        &self,
        ticket: FetchTicket,
        key: &str,
        workspace_id: &str,
        memories: Vec<Memory>,
    ) -> ApplyOutcome<Vec<Memory>> {
        self.apply(ticket, key, |s| {
            let all = &mut s.memory.memories;
            let previous: Vec<Memory> = all
                .iter()
                .filter(|m| m.workspace_id == workspace_id)
                .cloned()
                .collect();
            if previous == memories {
                return ApplyOutcome::Unchanged;
            }
            all.retain(|m| m.workspace_id != workspace_id);
            all.extend(memories);
            ApplyOutcome::Applied(previous)
        })
    }

    pub fn apply_invitations(
        &self,
        ticket: FetchTicket,
        key: &str,
        invitations: Vec<Invitation>,
    ) -> ApplyOutcome<Vec<Invitation>> {
        self.apply(ticket, key, |s| {
            replace_if_changed(&mut s.invitation.invitations, invitations)
        })
    }

    pub fn apply_integrations(
        &self,
        ticket: FetchTicket,
        key: &str,
        integrations: Vec<Integration>,
    ) -> ApplyOutcome<Vec<Integration>> {
        self.apply(ticket, key, |s| {
            replace_if_changed(&mut s.integration.integrations, integrations)
        })
    }

    fn apply<T>(
        &self,
        ticket: FetchTicket,
        key: &str,
        f: impl FnOnce(&mut StoreSnapshot) -> ApplyOutcome<T>,
    ) -> ApplyOutcome<T> {
        let mut inner = self.write_inner();

        if ticket.generation != inner.generation {
            drop(inner);
            debug!(%key, "Dropping fetch result from before a reset");
            counter!("chimera_stale_results_total", "reason" => "reset").increment(1);
            return ApplyOutcome::Stale;
        }
        let last_applied = inner.applied.get(key).copied().unwrap_or(0);
        if ticket.seq <= last_applied {
            drop(inner);
            debug!(%key, seq = ticket.seq, last_applied, "Dropping superseded fetch result");
            counter!("chimera_stale_results_total", "reason" => "superseded").increment(1);
            return ApplyOutcome::Stale;
        }

        let outcome = f(&mut inner.snapshot);
        if !outcome.is_stale() {
            inner.applied.insert(key.to_string(), ticket.seq);
        }
        outcome
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DataStores {
    fn default() -> Self {
        Self::new()
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut Vec<T>, incoming: Vec<T>) -> ApplyOutcome<Vec<T>> {
    if *slot == incoming {
        ApplyOutcome::Unchanged
    } else {
        ApplyOutcome::Applied(std::mem::replace(slot, incoming))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::{conversation, invitation, memory, message, user, workspace};

    fn populated() -> DataStores {
        let stores = DataStores::new();
        stores.set_authenticated(user("u-1"));
        let t = stores.begin_fetch();
        stores.apply_workspaces(t, "workspaces", vec![workspace("ws-1"), workspace("ws-2")]);
        let t = stores.begin_fetch();
        stores.apply_memories(t, "memories:ws-1", "ws-1", vec![memory("m-1", "ws-1", 1)]);
        let t = stores.begin_fetch();
        stores.apply_conversations(t, "conversations:ws-1", "ws-1", vec![conversation("c-1", "ws-1")]);
        let t = stores.begin_fetch();
        stores.apply_invitations(t, "invitations", vec![invitation("inv-1")]);
        stores.set_active_workspace(Some("ws-1".to_string()));
        stores
    }

    #[test]
    fn test_reset_all_restores_initial_shape() {
        let stores = populated();
        assert!(!stores.snapshot().is_initial());

        stores.reset_all();

        let snap = stores.snapshot();
        assert!(snap.is_initial());
        assert!(snap.chat.auto_store);
        assert_eq!(snap.memory.sort_by, MemorySort::Recent);
        assert_eq!(stores.generation(), 1);
    }

    #[test]
    fn test_reset_all_is_idempotent() {
        let stores = populated();
        stores.reset_all();
        stores.reset_all();
        assert!(stores.snapshot().is_initial());
    }

    #[test]
    fn test_result_from_before_reset_is_dropped() {
        let stores = DataStores::new();
        let ticket = stores.begin_fetch();
        stores.reset_all();

        let outcome = stores.apply_workspaces(ticket, "workspaces", vec![workspace("ws-1")]);

        assert!(outcome.is_stale());
        assert!(stores.snapshot().workspace.workspaces.is_empty());
    }

    #[test]
    fn test_older_ticket_never_overwrites_newer() {
        let stores = DataStores::new();
        let older = stores.begin_fetch();
        let newer = stores.begin_fetch();

        let applied = stores.apply_invitations(newer, "invitations", vec![invitation("inv-new")]);
        assert!(matches!(applied, ApplyOutcome::Applied(_)));

        let late = stores.apply_invitations(older, "invitations", vec![invitation("inv-old")]);
        assert!(late.is_stale());

        let ids: Vec<String> = stores.read(|s| {
            s.invitation.invitations.iter().map(|i| i.id.clone()).collect()
        });
        assert_eq!(ids, vec!["inv-new"]);
    }

    #[test]
    fn test_sequences_are_per_key() {
        let stores = DataStores::new();
        let older = stores.begin_fetch();
        let newer = stores.begin_fetch();

        stores.apply_workspaces(newer, "workspaces", vec![workspace("ws-1")]);
        let outcome = stores.apply_invitations(older, "invitations", vec![invitation("inv-1")]);

        assert!(matches!(outcome, ApplyOutcome::Applied(_)));
    }

    #[test]
    fn test_unchanged_result_reports_unchanged() {
        let stores = DataStores::new();
        let t = stores.begin_fetch();
        stores.apply_workspaces(t, "workspaces", vec![workspace("ws-1")]);
        let t = stores.begin_fetch();
        let outcome = stores.apply_workspaces(t, "workspaces", vec![workspace("ws-1")]);
        assert_eq!(outcome, ApplyOutcome::Unchanged);
    }

    #[test]
    fn test_memories_scoped_to_workspace() {
        let stores = DataStores::new();
        let t = stores.begin_fetch();
        stores.apply_memories(t, "memories:ws-1", "ws-1", vec![memory("m-1", "ws-1", 1)]);
        let t = stores.begin_fetch();
        stores.apply_memories(t, "memories:ws-2", "ws-2", vec![memory("m-2", "ws-2", 1)]);

        let t = stores.begin_fetch();
        let outcome = stores.apply_memories(t, "memories:ws-1", "ws-1", vec![]);

        match outcome {
            ApplyOutcome::Applied(previous) => assert_eq!(previous.len(), 1),
            other => panic!("expected Applied, got {other:?}"),
        }
        let ids: Vec<String> = stores.read(|s| s.memory.memories.iter().map(|m| m.id.clone()).collect());
        assert_eq!(ids, vec!["m-2"]);
    }

    #[test]
    fn test_conversation_refresh_keeps_loaded_messages() {
        let stores = DataStores::new();
        let t = stores.begin_fetch();
        stores.apply_conversations(t, "conversations:ws-1", "ws-1", vec![conversation("c-1", "ws-1")]);
        let t = stores.begin_fetch();
        stores.apply_messages(t, "messages:c-1", "c-1", vec![message("msg-1", "c-1")]);

        let t = stores.begin_fetch();
        let outcome =
            stores.apply_conversations(t, "conversations:ws-1", "ws-1", vec![conversation("c-1", "ws-1")]);

        assert_eq!(outcome, ApplyOutcome::Unchanged);
        let count = stores.read(|s| s.chat.conversations[0].messages.len());
        assert_eq!(count, 1);
    }

    #[test]
    fn test_messages_for_unknown_conversation_dropped() {
        let stores = DataStores::new();
        let t = stores.begin_fetch();
        let outcome = stores.apply_messages(t, "messages:c-9", "c-9", vec![message("msg-1", "c-9")]);
        assert!(outcome.is_stale());
    }

    #[test]
    fn test_set_loading_ignores_stale_ticket() {
        let stores = DataStores::new();
        let ticket = stores.begin_fetch();
        stores.reset_all();
        stores.set_loading(ticket, StoreDomain::Memory, true);
        assert!(!stores.snapshot().memory.is_loading);

        let ticket = stores.begin_fetch();
        stores.set_loading(ticket, StoreDomain::Memory, true);
        assert!(stores.snapshot().memory.is_loading);
    }

    #[test]
    fn test_active_workspace_tracks_previous() {
        let stores = DataStores::new();
        stores.set_active_workspace(Some("ws-1".to_string()));
        stores.set_active_workspace(Some("ws-2".to_string()));
        let ws = stores.snapshot().workspace;
        assert_eq!(ws.active_workspace_id.as_deref(), Some("ws-2"));
        assert_eq!(ws.previous_workspace_id.as_deref(), Some("ws-1"));
    }

    #[test]
    fn test_pending_invitation_count() {
        let mut state = InvitationState::default();
        state.invitations.push(invitation("inv-1"));
        let mut accepted = invitation("inv-2");
        accepted.status = InvitationStatus::Accepted;
        state.invitations.push(accepted);
        assert_eq!(state.pending_count(), 1);
    }
}
