//! Per-domain refresh operations
//!
//! A refresh takes a ticket, fetches from the backend, applies the result to
//! the stores and publishes what changed on the event bus. Results dropped by
//! the ticket guard publish nothing.

use super::event_bus::EventBus;
use super::events::EventType;
use super::errors::RealtimeResult;
use super::keys;
use crate::core_backend::{Backend, BackendResult};
use crate::core_store::{ApplyOutcome, DataStores, Entity, FetchTicket, InvitationStatus, StoreDomain};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Entities that appeared, changed or disappeared between two fetches
#[derive(Debug)]
pub struct Changes<'a, T> {
    pub created: Vec<&'a T>,
    pub updated: Vec<&'a T>,
    pub deleted: Vec<&'a T>,
}

impl<T> Changes<'_, T> {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Compare two collections by entity id and revision
pub fn diff<'a, T: Entity>(previous: &'a [T], current: &'a [T]) -> Changes<'a, T> {
    let before: HashMap<&str, &T> = previous.iter().map(|e| (e.entity_id(), e)).collect();
    let after: HashSet<&str> = current.iter().map(Entity::entity_id).collect();

    let mut changes = Changes { created: Vec::new(), updated: Vec::new(), deleted: Vec::new() };
    for entity in current {
        match before.get(entity.entity_id()) {
            None => changes.created.push(entity),
            Some(old) if old.revision() != entity.revision() => changes.updated.push(entity),
            Some(_) => {}
        }
    }
    changes.deleted = previous
        .iter()
        .filter(|e| !after.contains(e.entity_id()))
        .collect();
    changes
}

struct ChangeEvents {
    created: EventType,
    updated: EventType,
    deleted: EventType,
}

const CONVERSATION_EVENTS: ChangeEvents = ChangeEvents {
    created: EventType::ConversationCreated,
    updated: EventType::ConversationUpdated,
    deleted: EventType::ConversationDeleted,
};

const MESSAGE_EVENTS: ChangeEvents = ChangeEvents {
    created: EventType::MessageCreated,
    updated: EventType::MessageUpdated,
    deleted: EventType::MessageDeleted,
};

const MEMORY_EVENTS: ChangeEvents = ChangeEvents {
    created: EventType::MemoryCreated,
    updated: EventType::MemoryUpdated,
    deleted: EventType::MemoryDeleted,
};

/// Fetches domain data into the stores and announces changes on the bus
///
/// Every refresh takes its store ticket when it is called, not when the
/// returned future is first polled. A reset between the two always drops the
/// result.
#[derive(Clone)]
pub struct Refresher {
    backend: Arc<dyn Backend>,
    stores: Arc<DataStores>,
    bus: EventBus,
}

impl Refresher {
    pub fn new(backend: Arc<dyn Backend>, stores: Arc<DataStores>, bus: EventBus) -> Self {
        Self { backend, stores, bus }
    }

    /// Refresh the workspace list
    pub fn workspaces(&self) -> impl Future<Output = RealtimeResult<()>> + Send + 'static {
        let run = self.begin(StoreDomain::Workspace);
        async move { run.workspaces().await }
    }

    /// Refresh one workspace's details
    pub fn workspace(&self, workspace_id: &str) -> impl Future<Output = RealtimeResult<()>> + Send + 'static {
        let run = self.begin(StoreDomain::Workspace);
        let workspace_id = workspace_id.to_string();
        async move { run.workspace(&workspace_id).await }
    }

    /// Refresh a workspace's member list
    pub fn team(&self, workspace_id: &str) -> impl Future<Output = RealtimeResult<()>> + Send + 'static {
        let run = self.begin(StoreDomain::Workspace);
        let workspace_id = workspace_id.to_string();
        async move { run.team(&workspace_id).await }
    }

    /// Refresh a workspace's conversation list
    pub fn conversations(
        &self,
        workspace_id: &str,
    ) -> impl Future<Output = RealtimeResult<()>> + Send + 'static {
        let run = self.begin(StoreDomain::Chat);
        let workspace_id = workspace_id.to_string();
        async move { run.conversations(&workspace_id).await }
    }

    /// Refresh the messages of one conversation
    pub fn messages(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = RealtimeResult<()>> + Send + 'static {
        let run = self.begin(StoreDomain::Chat);
        let conversation_id = conversation_id.to_string();
        async move { run.messages(&conversation_id).await }
    }

    /// Refresh a workspace's memories
    pub fn memories(&self, workspace_id: &str) -> impl Future<Output = RealtimeResult<()>> + Send + 'static {
        let run = self.begin(StoreDomain::Memory);
        let workspace_id = workspace_id.to_string();
        async move { run.memories(&workspace_id).await }
    }

    /// Refresh invitations, announcing newly received pending ones
    pub fn invitations(&self) -> impl Future<Output = RealtimeResult<()>> + Send + 'static {
        let run = self.begin(StoreDomain::Invitation);
        async move { run.invitations().await }
    }

    /// Refresh provider integrations. Publishes nothing.
    pub fn integrations(&self) -> impl Future<Output = RealtimeResult<()>> + Send + 'static {
        let run = self.begin(StoreDomain::Integration);
        async move { run.integrations().await }
    }

    fn begin(&self, domain: StoreDomain) -> RefreshRun {
        RefreshRun {
            ticket: self.stores.begin_fetch(),
            domain,
            refresher: self.clone(),
        }
    }

    fn publish_changes<T: Entity + Serialize>(
        &self,
        changes: &Changes<'_, T>,
        events: &ChangeEvents,
        workspace_id: Option<&str>,
    ) {
        for entity in &changes.created {
            self.publish(events.created, *entity, workspace_id);
        }
        for entity in &changes.updated {
            self.publish(events.updated, *entity, workspace_id);
        }
        for entity in &changes.deleted {
            self.publish(events.deleted, *entity, workspace_id);
        }
    }

    fn publish<T: Serialize>(&self, event_type: EventType, entity: &T, workspace_id: Option<&str>) {
        match serde_json::to_value(entity) {
            Ok(payload) => {
                self.bus.emit(event_type, payload, workspace_id.map(str::to_string));
            }
            Err(e) => {
                warn!(
                    event = event_type.as_str(),
                    error = %e,
                    "Could not encode event payload, not publishing"
                );
            }
        }
    }
}

/// One refresh holding the ticket it was started with
struct RefreshRun {
    refresher: Refresher,
    ticket: FetchTicket,
    domain: StoreDomain,
}

impl RefreshRun {
    async fn workspaces(&self) -> RealtimeResult<()> {
        let r = &self.refresher;
        let current = self.fetch(r.backend.list_workspaces()).await?;

        let outcome = r.stores.apply_workspaces(self.ticket, keys::WORKSPACES, current.clone());
        if let ApplyOutcome::Applied(previous) = outcome {
            let changes = diff(&previous, &current);
            for workspace in changes.created.iter().chain(&changes.updated) {
                r.publish(EventType::WorkspaceUpdated, *workspace, Some(workspace.id.as_str()));
            }
            for workspace in &changes.deleted {
                r.publish(EventType::WorkspaceDeleted, *workspace, Some(workspace.id.as_str()));
            }
            log_changes(keys::WORKSPACES, &changes);
        }
        Ok(())
    }

    async fn workspace(&self, workspace_id: &str) -> RealtimeResult<()> {
        let r = &self.refresher;
        let current = self.fetch(r.backend.get_workspace(workspace_id)).await?;

        let key = keys::workspace(workspace_id);
        let outcome = r.stores.apply_workspace(self.ticket, &key, current.clone());
        if let ApplyOutcome::Applied(previous) = outcome {
            let changed = previous.map_or(true, |p| p.revision() != current.revision());
            if changed {
                r.publish(EventType::WorkspaceUpdated, &current, Some(workspace_id));
            }
        }
        Ok(())
    }

    async fn team(&self, workspace_id: &str) -> RealtimeResult<()> {
        let r = &self.refresher;
        let members = self.fetch(r.backend.list_team(workspace_id)).await?;

        let key = keys::team(workspace_id);
        let outcome = r.stores.apply_team(self.ticket, &key, workspace_id, members.clone());
        if let ApplyOutcome::Applied(_) = outcome {
            let payload = json!({ "workspaceId": workspace_id, "members": members });
            r.bus.emit(EventType::TeamUpdated, payload, Some(workspace_id.to_string()));
            debug!(%key, members = members.len(), "Team changed");
        }
        Ok(())
    }

    async fn conversations(&self, workspace_id: &str) -> RealtimeResult<()> {
        let r = &self.refresher;
        let current = self.fetch(r.backend.list_conversations(workspace_id)).await?;

        let key = keys::conversations(workspace_id);
        let outcome =
            r.stores
                .apply_conversations(self.ticket, &key, workspace_id, current.clone());
        if let ApplyOutcome::Applied(previous) = outcome {
            let changes = diff(&previous, &current);
            r.publish_changes(&changes, &CONVERSATION_EVENTS, Some(workspace_id));
            log_changes(&key, &changes);
        }
        Ok(())
    }

    async fn messages(&self, conversation_id: &str) -> RealtimeResult<()> {
        let r = &self.refresher;
        let current = self.fetch(r.backend.list_messages(conversation_id)).await?;

        let key = keys::messages(conversation_id);
        let outcome = r
            .stores
            .apply_messages(self.ticket, &key, conversation_id, current.clone());
        if let ApplyOutcome::Applied(previous) = outcome {
            let workspace_id = r.stores.read(|s| {
                s.chat
                    .conversations
                    .iter()
                    .find(|c| c.id == conversation_id)
                    .map(|c| c.workspace_id.clone())
            });
            let changes = diff(&previous, &current);
            r.publish_changes(&changes, &MESSAGE_EVENTS, workspace_id.as_deref());
            log_changes(&key, &changes);
        }
        Ok(())
    }

    async fn memories(&self, workspace_id: &str) -> RealtimeResult<()> {
        let r = &self.refresher;
        let current = self.fetch(r.backend.list_memories(workspace_id)).await?;

        let key = keys::memories(workspace_id);
        let outcome = r
            .stores
            .apply_memories(self.ticket, &key, workspace_id, current.clone());
        if let ApplyOutcome::Applied(previous) = outcome {
            let changes = diff(&previous, &current);
            r.publish_changes(&changes, &MEMORY_EVENTS, Some(workspace_id));
            log_changes(&key, &changes);
        }
        Ok(())
    }

    async fn invitations(&self) -> RealtimeResult<()> {
        let r = &self.refresher;
        let current = self.fetch(r.backend.list_invitations()).await?;

        let outcome = r
            .stores
            .apply_invitations(self.ticket, keys::INVITATIONS, current.clone());
        if let ApplyOutcome::Applied(previous) = outcome {
            let changes = diff(&previous, &current);
            for invitation in &changes.created {
                if invitation.status == InvitationStatus::Pending {
                    r.publish(
                        EventType::InvitationReceived,
                        *invitation,
                        Some(invitation.workspace_id.as_str()),
                    );
                }
            }
            log_changes(keys::INVITATIONS, &changes);
        }
        Ok(())
    }

    async fn integrations(&self) -> RealtimeResult<()> {
        let r = &self.refresher;
        let current = self.fetch(r.backend.list_integrations()).await?;
        r.stores.apply_integrations(self.ticket, keys::INTEGRATIONS, current);
        Ok(())
    }

    async fn fetch<T>(&self, call: impl Future<Output = BackendResult<T>>) -> RealtimeResult<T> {
        let stores = &self.refresher.stores;
        stores.set_loading(self.ticket, self.domain, true);
        let _loading = LoadingGuard { stores, ticket: self.ticket, domain: self.domain };
        Ok(call.await?)
    }
}

/// Clears a loading flag when a fetch ends, even if it is dropped midway
struct LoadingGuard<'a> {
    stores: &'a DataStores,
    ticket: FetchTicket,
    domain: StoreDomain,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.stores.set_loading(self.ticket, self.domain, false);
    }
}

fn log_changes<T>(key: &str, changes: &Changes<'_, T>) {
    if changes.is_empty() {
        return;
    }
    debug!(
        %key,
        created = changes.created.len(),
        updated = changes.updated.len(),
        deleted = changes.deleted.len(),
        "Applied refresh"
    );
}
