//! Multi-tab session scenarios
//!
//! Several clients share one credential storage, the way browser tabs share
//! an origin. Each runs its own session watch loop.

use anyhow::Result;
use chimera_core::{
    core_backend::{
        simulated::{DEMO_EMAIL, DEMO_PASSWORD},
        SimulatedBackend,
    },
    core_session::{
        CredentialStorage, FileStorage, RecordingNavigator, SessionFlags, SessionWatchState,
        StorageOrigin, AUTH_TOKEN_KEY,
    },
    shutdown::ShutdownCoordinator,
    ChimeraClient, Config, EventType, RealtimeContext,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Tab {
    client: ChimeraClient,
    navigator: Arc<RecordingNavigator>,
}

impl Tab {
    fn open(storage: Arc<dyn CredentialStorage>, backend: Arc<SimulatedBackend>) -> Result<Self> {
        let navigator = Arc::new(RecordingNavigator::new());
        let client = ChimeraClient::new(
            Config::default(),
            backend,
            storage,
            navigator.clone(),
            SessionFlags::new(),
        )?;
        Ok(Self { client, navigator })
    }

    fn assert_signed_in(&self) {
        assert!(self.client.is_authenticated());
        assert!(self.client.connection().is_connected());
        assert!(matches!(
            self.client.coordinator().state(),
            SessionWatchState::Watching { token: Some(_) }
        ));
    }

    fn assert_kicked_out(&self) {
        let stores = self.client.stores().snapshot();
        assert!(stores.is_initial());
        assert!(!self.client.connection().is_connected());
        assert!(self.client.connection().registry().is_empty());
        assert_eq!(self.client.coordinator().state(), SessionWatchState::Invalidated);
        assert_eq!(self.navigator.routes(), vec!["/auth/login"]);
    }
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

async fn advance(total: Duration) {
    let step = Duration::from_millis(100);
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        tokio::time::advance(step).await;
        settle().await;
        elapsed += step;
    }
}

#[tokio::test(start_paused = true)]
async fn logout_in_one_tab_signs_out_the_other() -> Result<()> {
    let origin = StorageOrigin::new();
    let backend = Arc::new(SimulatedBackend::new());
    let shutdown = ShutdownCoordinator::new(Duration::ZERO);

    let tab_a = Tab::open(Arc::new(origin.tab()), backend.clone())?;
    let tab_b = Tab::open(Arc::new(origin.tab()), backend.clone())?;
    tab_a.client.login(DEMO_EMAIL, DEMO_PASSWORD).await?;
    assert!(tab_b.client.restore_session().await?.is_some());

    let watch_a = tab_a.client.spawn_session_watch(shutdown.listener());
    let watch_b = tab_b.client.spawn_session_watch(shutdown.listener());
    settle().await;

    tab_a
        .client
        .set_context(RealtimeContext::signed_in().with_workspace("ws-neural"))?;
    settle().await;
    assert!(tab_a.client.stores().read(|s| !s.workspace.workspaces.is_empty()));

    tab_b.client.logout().await?;
    settle().await;

    tab_a.assert_kicked_out();
    assert!(tab_a.client.take_invalidation_notice());
    assert!(!tab_a.client.take_invalidation_notice());

    // The tab that logged out handles its own navigation
    assert_eq!(tab_b.navigator.count(), 0);
    assert_eq!(tab_b.client.coordinator().state(), SessionWatchState::Uninitialized);

    // Later rechecks must not repeat the reset
    let workspace_fetches = backend.call_count("get_workspace");
    advance(Duration::from_secs(10)).await;
    assert_eq!(tab_a.client.coordinator().invalidation_count(), 1);
    assert_eq!(tab_a.navigator.count(), 1);
    assert_eq!(backend.call_count("get_workspace"), workspace_fetches);

    shutdown.shutdown().await;
    watch_a.await?;
    watch_b.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn latest_login_wins() -> Result<()> {
    let origin = StorageOrigin::new();
    let backend = Arc::new(SimulatedBackend::new());
    let shutdown = ShutdownCoordinator::new(Duration::ZERO);

    let tab_a = Tab::open(Arc::new(origin.tab()), backend.clone())?;
    let tab_b = Tab::open(Arc::new(origin.tab()), backend.clone())?;
    tab_a.client.login(DEMO_EMAIL, DEMO_PASSWORD).await?;
    tab_b.client.restore_session().await?;
    let watch_a = tab_a.client.spawn_session_watch(shutdown.listener());
    let watch_b = tab_b.client.spawn_session_watch(shutdown.listener());
    settle().await;

    // Switching accounts in B replaces the shared token
    tab_b.client.login("ada@chimera.lab", "analytical").await?;
    settle().await;

    tab_a.assert_kicked_out();
    tab_b.assert_signed_in();
    assert_eq!(tab_b.navigator.count(), 0);

    // Signing in again from A re-arms A's watch and pushes B out
    tab_a.client.login("ada@chimera.lab", "analytical").await?;
    settle().await;

    tab_a.assert_signed_in();
    assert_eq!(tab_a.navigator.count(), 1);
    tab_b.assert_kicked_out();

    shutdown.shutdown().await;
    watch_a.await?;
    watch_b.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn clearing_storage_signs_out_every_tab() -> Result<()> {
    let origin = StorageOrigin::new();
    let backend = Arc::new(SimulatedBackend::new());
    let shutdown = ShutdownCoordinator::new(Duration::ZERO);

    let tabs = [
        Tab::open(Arc::new(origin.tab()), backend.clone())?,
        Tab::open(Arc::new(origin.tab()), backend.clone())?,
        Tab::open(Arc::new(origin.tab()), backend.clone())?,
    ];
    tabs[0].client.login(DEMO_EMAIL, DEMO_PASSWORD).await?;
    let mut watches = Vec::new();
    for tab in &tabs {
        tab.client.restore_session().await?;
        watches.push(tab.client.spawn_session_watch(shutdown.listener()));
    }
    settle().await;

    origin.clear();
    settle().await;

    for tab in &tabs {
        tab.assert_kicked_out();
    }

    shutdown.shutdown().await;
    for watch in watches {
        watch.await?;
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unrelated_keys_leave_the_session_alone() -> Result<()> {
    let origin = StorageOrigin::new();
    let backend = Arc::new(SimulatedBackend::new());
    let shutdown = ShutdownCoordinator::new(Duration::ZERO);

    let tab = Tab::open(Arc::new(origin.tab()), backend)?;
    tab.client.login(DEMO_EMAIL, DEMO_PASSWORD).await?;
    let watch = tab.client.spawn_session_watch(shutdown.listener());
    settle().await;

    let other = origin.tab();
    other.set("theme", "dark")?;
    other.set("refresh_token", "rotated")?;
    advance(Duration::from_secs(5)).await;

    tab.assert_signed_in();
    assert_eq!(tab.navigator.count(), 0);

    shutdown.shutdown().await;
    watch.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn file_storage_is_covered_by_recheck() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("session.json");
    let backend = Arc::new(SimulatedBackend::new());
    let shutdown = ShutdownCoordinator::new(Duration::ZERO);

    let tab_a = Tab::open(Arc::new(FileStorage::new(&path)), backend.clone())?;
    let tab_b = Tab::open(Arc::new(FileStorage::new(&path)), backend.clone())?;
    tab_a.client.login(DEMO_EMAIL, DEMO_PASSWORD).await?;
    tab_b.client.restore_session().await?;
    let watch_a = tab_a.client.spawn_session_watch(shutdown.listener());
    settle().await;

    tab_b.client.logout().await?;
    assert_eq!(FileStorage::new(&path).get(AUTH_TOKEN_KEY)?, None);

    // No storage events for files; the next recheck notices
    advance(Duration::from_millis(2_100)).await;
    tab_a.assert_kicked_out();

    shutdown.shutdown().await;
    watch_a.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn polling_publishes_changes_until_invalidated() -> Result<()> {
    let origin = StorageOrigin::new();
    let backend = Arc::new(SimulatedBackend::new());
    let shutdown = ShutdownCoordinator::new(Duration::ZERO);

    let tab = Tab::open(Arc::new(origin.tab()), backend.clone())?;
    tab.client.login(DEMO_EMAIL, DEMO_PASSWORD).await?;
    let watch = tab.client.spawn_session_watch(shutdown.listener());

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let _subscription = tab.client.bus().subscribe(EventType::MessageCreated, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    tab.client.set_context(
        RealtimeContext::signed_in()
            .with_workspace("ws-neural")
            .with_conversation("c-attention"),
    )?;
    // Conversations land at 3s, so the 4s message poll fills the seeded history
    advance(Duration::from_millis(4_100)).await;
    let seeded = received.load(Ordering::SeqCst);
    assert_eq!(seeded, 2);

    let mut reply = tab
        .client
        .stores()
        .read(|s| s.chat.conversations.iter().find(|c| c.id == "c-attention").cloned())
        .and_then(|c| c.messages.last().cloned())
        .expect("seeded conversation has messages");
    reply.id = "msg-new".to_string();
    reply.timestamp += chrono::Duration::seconds(1);
    assert!(backend.push_message(reply));

    advance(Duration::from_secs(2)).await;
    assert_eq!(received.load(Ordering::SeqCst), seeded + 1);

    origin.tab().remove(AUTH_TOKEN_KEY)?;
    settle().await;
    tab.assert_kicked_out();

    advance(Duration::from_secs(6)).await;
    assert_eq!(received.load(Ordering::SeqCst), seeded + 1);

    shutdown.shutdown().await;
    watch.await?;
    Ok(())
}
