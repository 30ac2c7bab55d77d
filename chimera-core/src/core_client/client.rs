//! Client root wiring every component together

use super::errors::ClientResult;
use crate::config::Config;
use crate::core_backend::{Backend, BackendError};
use crate::core_realtime::{
    ConnectionFlag, ConnectionState, EventBus, PollIntervalRegistry, RealtimeContext,
    RealtimeService, Refresher,
};
use crate::core_session::{
    CredentialStorage, Navigator, SessionConsistencyCoordinator, SessionFlags, AUTH_TOKEN_KEY,
    REFRESH_TOKEN_KEY, SESSION_INVALIDATED_FLAG,
};
use crate::core_store::{DataStores, User};
use crate::shutdown::ShutdownListener;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One client instance, the equivalent of a browser tab
///
/// Owns the event bus, the data stores, the connection state with its poll
/// registry, the realtime service and the session coordinator. Nothing is
/// global: two clients in one process behave like two tabs.
pub struct ChimeraClient {
    config: Config,
    backend: Arc<dyn Backend>,
    storage: Arc<dyn CredentialStorage>,
    flags: SessionFlags,
    bus: EventBus,
    stores: Arc<DataStores>,
    connection: Arc<ConnectionState>,
    realtime: RealtimeService,
    coordinator: Arc<SessionConsistencyCoordinator>,
}

impl ChimeraClient {
    /// Build a disconnected, signed-out client
    pub fn new(
        config: Config,
        backend: Arc<dyn Backend>,
        storage: Arc<dyn CredentialStorage>,
        navigator: Arc<dyn Navigator>,
        flags: SessionFlags,
    ) -> ClientResult<Self> {
        config.validate()?;

        let flag = ConnectionFlag::new();
        let registry = Arc::new(PollIntervalRegistry::new(
            flag.clone(),
            config.polling.fetch_timeout,
        ));
        let connection = Arc::new(ConnectionState::new(flag, registry));
        let bus = EventBus::new();
        let stores = Arc::new(DataStores::new());

        let refresher = Refresher::new(backend.clone(), stores.clone(), bus.clone());
        let realtime = RealtimeService::new(connection.clone(), refresher, config.polling.clone());
        let coordinator = Arc::new(SessionConsistencyCoordinator::new(
            storage.clone(),
            connection.clone(),
            stores.clone(),
            navigator,
            flags.clone(),
            &config.session,
        ));

        Ok(Self {
            config,
            backend,
            storage,
            flags,
            bus,
            stores,
            connection,
            realtime,
            coordinator,
        })
    }

    /// Sign in with email and password
    pub async fn login(&self, email: &str, password: &str) -> ClientResult<User> {
        let session = match self.backend.login(email, password).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Login failed");
                self.stores.set_auth_error(e.to_string());
                return Err(e.into());
            }
        };

        // Our own token write must not look like a foreign change
        self.coordinator.reset_to_uninitialized();
        self.storage.set(AUTH_TOKEN_KEY, &session.token)?;
        self.storage.set(REFRESH_TOKEN_KEY, &session.refresh)?;

        self.establish(&session.user);
        info!(user_id = %session.user.id, "Logged in");
        Ok(session.user)
    }

    /// Resume the session whose token is already in storage
    ///
    /// Returns `None` when there is no token or the backend rejects it. A
    /// rejected token is removed.
    pub async fn restore_session(&self) -> ClientResult<Option<User>> {
        let Some(token) = self.storage.get(AUTH_TOKEN_KEY)? else {
            debug!("No stored session to restore");
            return Ok(None);
        };

        match self.backend.current_user(&token).await {
            Ok(user) => {
                self.establish(&user);
                info!(user_id = %user.id, "Session restored");
                Ok(Some(user))
            }
            Err(BackendError::Unauthorized) => {
                info!("Stored session was rejected, discarding it");
                self.storage.remove(AUTH_TOKEN_KEY)?;
                self.storage.remove(REFRESH_TOKEN_KEY)?;
                Ok(None)
            }
            Err(e) => {
                self.stores.set_auth_error(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Sign out of this tab and every other tab sharing the storage
    pub async fn logout(&self) -> ClientResult<()> {
        self.connection.disconnect();

        let token = self.storage.get(AUTH_TOKEN_KEY)?;
        if let Some(token) = &token {
            if let Err(e) = self.backend.logout(token).await {
                warn!(error = %e, "Backend logout failed, clearing local session anyway");
            }
        }

        // Stop watching before removing the token we are watching
        self.coordinator.reset_to_uninitialized();
        self.storage.remove(AUTH_TOKEN_KEY)?;
        self.storage.remove(REFRESH_TOKEN_KEY)?;

        self.stores.reset_all();
        self.coordinator.observe_user(None);
        info!("Logged out");
        Ok(())
    }

    /// Point polling at what the current view shows
    pub fn set_context(&self, context: RealtimeContext) -> ClientResult<()> {
        self.stores.set_active_workspace(context.workspace_id.clone());
        self.stores.set_active_conversation(context.conversation_id.clone());
        self.realtime.sync_context(context)?;
        Ok(())
    }

    /// Fetch provider integrations once
    pub async fn load_integrations(&self) -> ClientResult<()> {
        self.realtime.refresher().integrations().await?;
        Ok(())
    }

    /// Run the session watch loop until `shutdown`
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_session_watch(&self, shutdown: ShutdownListener) -> JoinHandle<()> {
        let events = self.storage.subscribe();
        tokio::spawn(self.coordinator.clone().run(events, shutdown))
    }

    /// Read and clear the "session invalidated" notice for the login view
    pub fn take_invalidation_notice(&self) -> bool {
        self.flags.take(SESSION_INVALIDATED_FLAG)
    }

    pub fn is_authenticated(&self) -> bool {
        self.stores.read(|s| s.auth.is_authenticated)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn stores(&self) -> &Arc<DataStores> {
        &self.stores
    }

    pub fn connection(&self) -> &Arc<ConnectionState> {
        &self.connection
    }

    pub fn coordinator(&self) -> &Arc<SessionConsistencyCoordinator> {
        &self.coordinator
    }

    pub fn realtime(&self) -> &RealtimeService {
        &self.realtime
    }

    /// Signed-in state for `user` with the token already in storage
    fn establish(&self, user: &User) {
        // Identity tracking first: a different user resets the stores
        self.coordinator.observe_user(Some(user));
        self.stores.set_authenticated(user.clone());
        self.coordinator.begin_watching();
        self.connection.connect();
    }
}
