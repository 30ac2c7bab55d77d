//! Graceful shutdown coordinator
//!
//! Long-running tasks (the session watch loop, the CLI `watch` command) hold
//! a [`ShutdownListener`] and stop when the coordinator broadcasts.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

/// Shutdown signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Graceful,
    Immediate,
}

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Graceful shutdown coordinator
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator that waits `grace_period` after broadcasting a
    /// graceful shutdown before reporting it complete
    pub fn new(grace_period: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            shutdown_tx,
            grace_period,
        }
    }

    /// Listener that also observes a shutdown that already happened
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.shutdown_tx.subscribe(),
            state: self.state.clone(),
        }
    }

    /// Initiate graceful shutdown
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        if *state != ShutdownState::Running {
            warn!("Shutdown already in progress");
            return;
        }
        info!("Initiating graceful shutdown");

        *state = ShutdownState::ShuttingDown;
        drop(state);

        // No receivers is fine: nothing is running that needs to stop.
        let _ = self.shutdown_tx.send(ShutdownSignal::Graceful);

        tokio::time::sleep(self.grace_period).await;

        *self.state.write().await = ShutdownState::Shutdown;
        info!("Shutdown complete");
    }

    /// Get current state
    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    /// Wait until shutdown begins
    pub async fn wait_for_shutdown(&self) {
        self.listener().recv().await;
    }
}

/// Receiving end of the shutdown broadcast
pub struct ShutdownListener {
    rx: broadcast::Receiver<ShutdownSignal>,
    state: Arc<RwLock<ShutdownState>>,
}

impl ShutdownListener {
    /// Resolve once shutdown has begun
    ///
    /// Returns immediately if it began before this listener was polled.
    pub async fn recv(&mut self) -> ShutdownSignal {
        match *self.state.read().await {
            ShutdownState::Running => {}
            ShutdownState::ShuttingDown => return ShutdownSignal::Graceful,
            ShutdownState::Shutdown => return ShutdownSignal::Immediate,
        }

        match self.rx.recv().await {
            Ok(signal) => signal,
            Err(broadcast::error::RecvError::Lagged(_)) => ShutdownSignal::Graceful,
            // Coordinator dropped: nobody can ask us to keep running
            Err(broadcast::error::RecvError::Closed) => ShutdownSignal::Immediate,
        }
    }
}

/// Install signal handlers for graceful shutdown
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        coordinator.shutdown().await;
    });
}

/// Install signal handlers for graceful shutdown (Windows)
#[cfg(windows)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        info!("Received Ctrl+C");
        coordinator.shutdown().await;
    });
}
