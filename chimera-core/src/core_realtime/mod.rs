//! Realtime layer: event bus, poll timers and the polling facade
//!
//! Polling is the only producer of events. Each poll tick runs a refresher
//! that updates the data stores and publishes what changed on the
//! [`EventBus`]. [`ConnectionState`] gates every tick and stops all timers on
//! disconnect.

pub mod connection;
pub mod errors;
pub mod event_bus;
pub mod events;
pub mod keys;
pub mod poll_registry;
pub mod refresh;
pub mod service;

pub use connection::{ConnectionFlag, ConnectionState};
pub use errors::{RealtimeError, RealtimeResult};
pub use event_bus::{EventBus, Subscription};
pub use events::{EventType, RealtimeEvent, UnknownEventType};
pub use poll_registry::{fetch_fn, FetchOp, FetchRun, PollIntervalRegistry};
pub use refresh::{diff, Changes, Refresher};
pub use service::{PollTarget, RealtimeContext, RealtimeService};
