//! Router seam used by the session coordinator

use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Replaces the current route
pub trait Navigator: Send + Sync {
    /// Replace the current history entry with `route`
    fn replace(&self, route: &str);
}

/// Navigator that only logs the requested route
#[derive(Debug, Default)]
pub struct LoggingNavigator;

impl Navigator for LoggingNavigator {
    fn replace(&self, route: &str) {
        info!(%route, "Navigation requested");
    }
}

/// Navigator that remembers every replacement
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    routes: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes requested so far, oldest first
    pub fn routes(&self) -> Vec<String> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self) -> usize {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Navigator for RecordingNavigator {
    fn replace(&self, route: &str) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(route.to_string());
    }
}
