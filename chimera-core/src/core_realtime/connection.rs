//! Connection state gating background polling

use super::poll_registry::PollIntervalRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Shared "connected" flag read by poll timers at tick time
#[derive(Debug, Clone, Default)]
pub struct ConnectionFlag(Arc<AtomicBool>);

impl ConnectionFlag {
    /// Create a flag in the disconnected state
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value
    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, connected: bool) -> bool {
        self.0.swap(connected, Ordering::AcqRel)
    }
}

/// Single source of truth for whether background polling should be active
///
/// Disconnecting always stops every timer in the registry, so a
/// disconnected client never has residual timers.
pub struct ConnectionState {
    flag: ConnectionFlag,
    registry: Arc<PollIntervalRegistry>,
}

impl ConnectionState {
    /// Create a disconnected state over `registry`
    ///
    /// The registry must have been built with the same [`ConnectionFlag`]
    /// so that its ticks observe this state.
    pub fn new(flag: ConnectionFlag, registry: Arc<PollIntervalRegistry>) -> Self {
        Self { flag, registry }
    }

    /// Mark the client connected. Idempotent.
    pub fn connect(&self) {
        if !self.flag.set(true) {
            info!("Realtime connected");
        }
    }

    /// Mark the client disconnected and stop every poll timer
    pub fn disconnect(&self) {
        let was_connected = self.flag.set(false);
        self.registry.stop_all();
        if was_connected {
            info!("Realtime disconnected");
        }
    }

    /// Whether polling callbacks currently run
    pub fn is_connected(&self) -> bool {
        self.flag.is_connected()
    }

    /// The flag shared with the poll registry
    pub fn flag(&self) -> &ConnectionFlag {
        &self.flag
    }

    /// The registry this state controls
    pub fn registry(&self) -> &Arc<PollIntervalRegistry> {
        &self.registry
    }
}
