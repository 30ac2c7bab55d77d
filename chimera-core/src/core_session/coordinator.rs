//! Per-tab session consistency watchdog
//!
//! Watches the persisted credential token and the signed-in user. When the
//! token changes under the tab (logout or login elsewhere, manual edits) the
//! coordinator invalidates the session:
//!
//! 1. disconnect, which stops every poll timer
//! 2. reset every data store in one step
//! 3. set the `session_invalidated` flag for the login view
//! 4. replace the current route with the login route
//!
//! The storage-event path and the recheck path may both observe the same
//! change. The transition to `Invalidated` happens under the state lock, so
//! only the first one performs the steps above.

use super::navigator::Navigator;
use super::storage::{
    CredentialStorage, StorageEvent, StorageEventReceiver, StorageRecvError, SessionFlags,
    AUTH_TOKEN_KEY, SESSION_INVALIDATED_FLAG,
};
use crate::config::SessionConfig;
use crate::core_realtime::ConnectionState;
use crate::core_store::{DataStores, User};
use crate::shutdown::ShutdownListener;
use metrics::counter;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Watch state of one tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionWatchState {
    Uninitialized,
    /// Watching, with the token this tab last observed
    Watching { token: Option<String> },
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// Another tab stored a different token
    TokenChanged,
    /// Another tab removed the token or cleared storage
    TokenRemoved,
    /// The periodic check found a different token in storage
    TokenMismatchOnRecheck,
    /// A user is signed in but storage holds no token
    TokenLostWhileAuthenticated,
}

impl InvalidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationReason::TokenChanged => "token_changed",
            InvalidationReason::TokenRemoved => "token_removed",
            InvalidationReason::TokenMismatchOnRecheck => "token_mismatch_on_recheck",
            InvalidationReason::TokenLostWhileAuthenticated => "token_lost_while_authenticated",
        }
    }
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct WatchInner {
    state: SessionWatchState,
    last_user_id: Option<String>,
    invalidations: u64,
}

pub struct SessionConsistencyCoordinator {
    storage: Arc<dyn CredentialStorage>,
    connection: Arc<ConnectionState>,
    stores: Arc<DataStores>,
    navigator: Arc<dyn Navigator>,
    flags: SessionFlags,
    login_route: String,
    recheck_interval: Duration,
    inner: Mutex<WatchInner>,
}

impl SessionConsistencyCoordinator {
    pub fn new(
        storage: Arc<dyn CredentialStorage>,
        connection: Arc<ConnectionState>,
        stores: Arc<DataStores>,
        navigator: Arc<dyn Navigator>,
        flags: SessionFlags,
        config: &SessionConfig,
    ) -> Self {
        Self {
            storage,
            connection,
            stores,
            navigator,
            flags,
            login_route: config.login_route.clone(),
            recheck_interval: config.recheck_interval,
            inner: Mutex::new(WatchInner {
                state: SessionWatchState::Uninitialized,
                last_user_id: None,
                invalidations: 0,
            }),
        }
    }

    /// Start watching the token currently in storage
    ///
    /// From `Invalidated` (after a fresh login) this re-enters through
    /// `Uninitialized`. Calling it while already watching re-reads the token.
    pub fn begin_watching(&self) {
        let token = self.stored_token();
        let mut inner = self.inner();
        if inner.state == SessionWatchState::Invalidated {
            debug!("Re-entering session watch after invalidation");
            inner.state = SessionWatchState::Uninitialized;
        }
        debug!(has_token = token.is_some(), "Watching session token");
        inner.state = SessionWatchState::Watching { token };
    }

    /// Return to `Uninitialized`, as after a local logout
    pub fn reset_to_uninitialized(&self) {
        self.inner().state = SessionWatchState::Uninitialized;
    }

    /// React to a storage change made by another tab
    ///
    /// Returns whether this call invalidated the session.
    pub fn handle_storage_event(&self, event: &StorageEvent) -> bool {
        if !event.touches_auth_token() {
            return false;
        }

        let reason = {
            let inner = self.inner();
            let SessionWatchState::Watching { token } = &inner.state else {
                return false;
            };
            if event.new_value == *token {
                return false;
            }
            match event.new_value {
                Some(_) => InvalidationReason::TokenChanged,
                None => InvalidationReason::TokenRemoved,
            }
        };
        self.invalidate(reason)
    }

    /// Compare the stored token with the watched one
    ///
    /// Returns whether this call invalidated the session.
    pub fn recheck(&self) -> bool {
        let stored = self.stored_token();
        let mismatch = match &self.inner().state {
            SessionWatchState::Watching { token } => *token != stored,
            _ => false,
        };
        mismatch && self.invalidate(InvalidationReason::TokenMismatchOnRecheck)
    }

    /// Observe the signed-in user
    ///
    /// A user with no stored token invalidates the session. A change of user
    /// id (including signing out) disconnects and resets the stores without
    /// navigating; this covers account switches inside one tab.
    ///
    /// Returns whether this call invalidated the session.
    pub fn observe_user(&self, user: Option<&User>) -> bool {
        let invalidated = user.is_some()
            && self.stored_token().is_none()
            && self.invalidate(InvalidationReason::TokenLostWhileAuthenticated);

        let new_id = user.map(|u| u.id.clone());
        let switched = {
            let mut inner = self.inner();
            let previous = std::mem::replace(&mut inner.last_user_id, new_id.clone());
            previous.is_some() && previous != new_id
        };
        if switched {
            info!(user_id = ?new_id, "Signed-in user changed, resetting local state");
            self.connection.disconnect();
            self.stores.reset_all();
        }
        invalidated
    }

    /// Invalidate the session if it is being watched
    ///
    /// Idempotent: returns `false` and does nothing unless the state was
    /// `Watching`.
    pub fn invalidate(&self, reason: InvalidationReason) -> bool {
        {
            let mut inner = self.inner();
            if !matches!(inner.state, SessionWatchState::Watching { .. }) {
                debug!(%reason, state = ?inner.state, "Ignoring invalidation");
                return false;
            }
            inner.state = SessionWatchState::Invalidated;
            inner.invalidations += 1;
        }

        warn!(%reason, "Session invalidated, discarding local state");
        counter!("chimera_session_invalidations_total", "reason" => reason.as_str()).increment(1);

        self.connection.disconnect();
        self.stores.reset_all();
        self.flags.set(SESSION_INVALIDATED_FLAG);
        self.navigator.replace(&self.login_route);
        true
    }

    /// Watch loop: storage events, periodic rechecks and shutdown
    ///
    /// Keeps running after an invalidation so a later login is watched
    /// again.
    pub async fn run(self: Arc<Self>, mut events: Option<StorageEventReceiver>, mut shutdown: ShutdownListener) {
        let mut ticker = time::interval_at(Instant::now() + self.recheck_interval, self.recheck_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            recheck_interval = ?self.recheck_interval,
            storage_events = events.is_some(),
            "Session watch started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.recheck();
                }
                received = next_event(&mut events) => match received {
                    Ok(event) => {
                        self.handle_storage_event(&event);
                    }
                    Err(StorageRecvError::Lagged(missed)) => {
                        // Recheck covers whatever was missed
                        warn!(missed, "Session watch fell behind on storage events");
                        self.recheck();
                    }
                    Err(StorageRecvError::Closed) => {
                        debug!("Storage events closed, relying on recheck");
                        events = None;
                    }
                },
            }
        }
        info!("Session watch stopped");
    }

    pub fn state(&self) -> SessionWatchState {
        self.inner().state.clone()
    }

    /// Token held while watching
    pub fn watched_token(&self) -> Option<String> {
        match &self.inner().state {
            SessionWatchState::Watching { token } => token.clone(),
            _ => None,
        }
    }

    /// Number of invalidations performed
    pub fn invalidation_count(&self) -> u64 {
        self.inner().invalidations
    }

    pub fn last_user_id(&self) -> Option<String> {
        self.inner().last_user_id.clone()
    }

    /// Stored token; an unreadable store counts as "no token"
    fn stored_token(&self) -> Option<String> {
        match self.storage.get(AUTH_TOKEN_KEY) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Could not read credential storage");
                None
            }
        }
    }

    fn inner(&self) -> MutexGuard<'_, WatchInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn next_event(
    events: &mut Option<StorageEventReceiver>,
) -> Result<StorageEvent, StorageRecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
