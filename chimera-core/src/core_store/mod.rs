//! Client-side data stores
//!
//! Domain entities plus the [`DataStores`] container that holds every slice
//! (auth, workspaces, chat, memories, invitations, integrations) behind one
//! lock.

pub mod state;
pub mod types;

pub use state::{
    ApplyOutcome, AuthState, ChatState, DataStores, FetchTicket, IntegrationState,
    InvitationState, MemorySort, MemoryState, StoreDomain, StoreSlice, StoreSnapshot,
    WorkspaceState,
};
pub use types::{
    AuthSession, Conversation, ConversationStatus, Entity, InjectedMemory, Integration,
    IntegrationStatus, Invitation, InvitationStatus, MemberRole, Memory, Message, MessageRole,
    Presence, Provider, TeamMember, User, Workspace, WorkspaceStats,
};
