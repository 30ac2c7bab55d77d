//! Chimera Protocol client core
//!
//! Polling-driven realtime updates, the data stores they feed, and the
//! session watchdog that keeps several tabs of one origin consistent.

pub mod config;
pub mod core_backend;
pub mod core_client;
pub mod core_realtime;
pub mod core_session;
pub mod core_store;
pub mod logging;
pub mod metrics;
pub mod shutdown;

#[cfg(test)]
mod test_utils;

pub use config::Config;
pub use core_client::{ChimeraClient, ClientError, ClientResult};
pub use core_realtime::{EventBus, EventType, RealtimeContext, RealtimeEvent};
pub use logging::{init_logging, LogLevel};
