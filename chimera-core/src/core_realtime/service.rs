//! Domain-level polling facade
//!
//! Knows which data domains exist, how often each is polled and how their
//! poll keys are scoped. [`RealtimeService::sync_context`] reconciles the live
//! timers with what the current view needs.

use super::connection::ConnectionState;
use super::errors::RealtimeResult;
use super::keys;
use super::poll_registry::{fetch_fn, FetchOp, FetchRun, PollIntervalRegistry};
use super::refresh::Refresher;
use crate::config::PollingConfig;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// What the current view is looking at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealtimeContext {
    pub authenticated: bool,
    pub workspace_id: Option<String>,
    pub conversation_id: Option<String>,
}

impl RealtimeContext {
    /// Signed-in context with nothing selected
    pub fn signed_in() -> Self {
        Self { authenticated: true, ..Self::default() }
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Poll targets this context requires
    pub fn targets(&self) -> Vec<PollTarget> {
        if !self.authenticated {
            return Vec::new();
        }
        let mut targets = vec![PollTarget::Workspaces, PollTarget::Invitations];
        if let Some(ws) = &self.workspace_id {
            targets.push(PollTarget::Workspace(ws.clone()));
            targets.push(PollTarget::Conversations(ws.clone()));
            targets.push(PollTarget::Memories(ws.clone()));
            targets.push(PollTarget::Team(ws.clone()));
        }
        if let Some(conversation) = &self.conversation_id {
            targets.push(PollTarget::Messages(conversation.clone()));
        }
        targets
    }
}

/// A pollable data domain and its scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PollTarget {
    Workspaces,
    Workspace(String),
    Conversations(String),
    Messages(String),
    Memories(String),
    Team(String),
    Invitations,
}

impl PollTarget {
    pub fn key(&self) -> String {
        match self {
            PollTarget::Workspaces => keys::WORKSPACES.to_string(),
            PollTarget::Workspace(id) => keys::workspace(id),
            PollTarget::Conversations(ws) => keys::conversations(ws),
            PollTarget::Messages(conversation) => keys::messages(conversation),
            PollTarget::Memories(ws) => keys::memories(ws),
            PollTarget::Team(ws) => keys::team(ws),
            PollTarget::Invitations => keys::INVITATIONS.to_string(),
        }
    }

    fn interval(&self, config: &PollingConfig) -> Duration {
        match self {
            PollTarget::Workspaces => config.workspaces,
            PollTarget::Workspace(_) => config.workspace_detail,
            PollTarget::Conversations(_) => config.conversations,
            PollTarget::Messages(_) => config.messages,
            PollTarget::Memories(_) => config.memories,
            PollTarget::Team(_) => config.team,
            PollTarget::Invitations => config.invitations,
        }
    }

    /// Only the workspace detail poll fetches as soon as it starts
    fn fetches_immediately(&self) -> bool {
        matches!(self, PollTarget::Workspace(_))
    }
}

pub struct RealtimeService {
    connection: Arc<ConnectionState>,
    refresher: Refresher,
    intervals: PollingConfig,
    context: Mutex<RealtimeContext>,
}

impl RealtimeService {
    pub fn new(connection: Arc<ConnectionState>, refresher: Refresher, intervals: PollingConfig) -> Self {
        Self {
            connection,
            refresher,
            intervals,
            context: Mutex::new(RealtimeContext::default()),
        }
    }

    pub fn start_workspaces_polling(&self) -> RealtimeResult<()> {
        self.start(&PollTarget::Workspaces)
    }

    /// Poll one workspace's details, fetching once right away
    pub fn start_workspace_polling(&self, workspace_id: &str) -> RealtimeResult<()> {
        self.start(&PollTarget::Workspace(workspace_id.to_string()))
    }

    pub fn start_conversations_polling(&self, workspace_id: &str) -> RealtimeResult<()> {
        self.start(&PollTarget::Conversations(workspace_id.to_string()))
    }

    pub fn start_messages_polling(&self, conversation_id: &str) -> RealtimeResult<()> {
        self.start(&PollTarget::Messages(conversation_id.to_string()))
    }

    pub fn start_memories_polling(&self, workspace_id: &str) -> RealtimeResult<()> {
        self.start(&PollTarget::Memories(workspace_id.to_string()))
    }

    pub fn start_team_polling(&self, workspace_id: &str) -> RealtimeResult<()> {
        self.start(&PollTarget::Team(workspace_id.to_string()))
    }

    pub fn start_invitations_polling(&self) -> RealtimeResult<()> {
        self.start(&PollTarget::Invitations)
    }

    /// Stop one poll by key. Returns whether it was running.
    pub fn stop_polling(&self, key: &str) -> bool {
        self.registry().stop(key)
    }

    pub fn stop_all_polling(&self) {
        self.registry().stop_all();
    }

    /// Reconcile live polls with `context`
    ///
    /// Polls the context no longer needs are stopped, missing ones are
    /// started, and polls that are already running keep their cadence. An
    /// unauthenticated context or a disconnected client stops everything,
    /// including when the client disconnects while this runs.
    pub fn sync_context(&self, context: RealtimeContext) -> RealtimeResult<()> {
        let registry = self.registry();
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = context.clone();

        if !context.authenticated || !self.connection.is_connected() {
            registry.stop_all();
            return Ok(());
        }

        let targets = context.targets();
        let wanted: HashSet<String> = targets.iter().map(PollTarget::key).collect();

        for key in registry.active_keys() {
            if !wanted.contains(&key) {
                registry.stop(&key);
            }
        }
        for target in &targets {
            if registry.is_active(&target.key()) {
                continue;
            }
            let op = self.fetch_op(target.clone());
            let started = registry.start_if_connected(
                target.key(),
                target.interval(&self.intervals),
                op,
                target.fetches_immediately(),
            )?;
            if !started {
                debug!("Disconnected while syncing realtime context");
                return Ok(());
            }
        }

        debug!(
            workspace_id = ?context.workspace_id,
            conversation_id = ?context.conversation_id,
            polls = wanted.len(),
            "Synced realtime context"
        );
        Ok(())
    }

    /// Context passed to the last [`sync_context`](Self::sync_context)
    pub fn context(&self) -> RealtimeContext {
        self.context.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn refresher(&self) -> &Refresher {
        &self.refresher
    }

    fn registry(&self) -> &Arc<PollIntervalRegistry> {
        self.connection.registry()
    }

    fn start(&self, target: &PollTarget) -> RealtimeResult<()> {
        let interval = target.interval(&self.intervals);
        let op = self.fetch_op(target.clone());
        if target.fetches_immediately() {
            self.registry().start_immediate(target.key(), interval, op)
        } else {
            self.registry().start(target.key(), interval, op)
        }
    }

    fn fetch_op(&self, target: PollTarget) -> Arc<dyn FetchOp> {
        let refresher = self.refresher.clone();
        fetch_fn(move || refresh(&refresher, &target))
    }
}

fn refresh(refresher: &Refresher, target: &PollTarget) -> FetchRun {
    match target {
        PollTarget::Workspaces => Box::pin(refresher.workspaces()),
        PollTarget::Workspace(id) => Box::pin(refresher.workspace(id)),
        PollTarget::Conversations(ws) => Box::pin(refresher.conversations(ws)),
        PollTarget::Messages(conversation) => Box::pin(refresher.messages(conversation)),
        PollTarget::Memories(ws) => Box::pin(refresher.memories(ws)),
        PollTarget::Team(ws) => Box::pin(refresher.team(ws)),
        PollTarget::Invitations => Box::pin(refresher.invitations()),
    }
}
