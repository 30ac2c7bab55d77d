//! In-process publish/subscribe registry
//!
//! Handlers are registered either for one [`EventType`] or for every event
//! (wildcard). Delivery is synchronous: type-specific handlers first, then
//! wildcard handlers, each group in registration order.
//!
//! A handler that panics is isolated. The panic is caught and reported
//! through `tracing` and the `chimera_event_handler_faults_total` counter,
//! and delivery continues with the next handler. The publisher never sees
//! it.

use super::events::{EventType, RealtimeEvent};
use metrics::counter;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{error, trace};

type Handler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

#[derive(Clone)]
struct Registration {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    typed: HashMap<EventType, Vec<Registration>>,
    wildcard: Vec<Registration>,
}

struct BusInner {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, target: Target, id: u64) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        match target {
            Target::Type(event_type) => {
                if let Some(list) = registry.typed.get_mut(&event_type) {
                    list.retain(|r| r.id != id);
                    if list.is_empty() {
                        registry.typed.remove(&event_type);
                    }
                }
            }
            Target::Wildcard => registry.wildcard.retain(|r| r.id != id),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Type(EventType),
    Wildcard,
}

/// Event bus shared by producers (refreshers) and consumers (views)
///
/// Cloning is cheap and every clone refers to the same registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: RwLock::new(Registry::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `handler` for exactly one event type
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = self.inner.registry.write().unwrap_or_else(PoisonError::into_inner);
            registry.typed.entry(event_type).or_default().push(Registration {
                id,
                handler: Arc::new(handler),
            });
        }
        trace!(%event_type, subscriber = id, "subscribed");
        Subscription::new(&self.inner, Target::Type(event_type), id)
    }

    /// Register `handler` for every event type
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = self.inner.registry.write().unwrap_or_else(PoisonError::into_inner);
            registry.wildcard.push(Registration {
                id,
                handler: Arc::new(handler),
            });
        }
        trace!(subscriber = id, "subscribed to all events");
        Subscription::new(&self.inner, Target::Wildcard, id)
    }

    /// Deliver `event` to every matching handler and return how many ran to
    /// completion.
    ///
    /// The handler list is snapshotted before dispatch, so handlers are free
    /// to subscribe or unsubscribe while the event is being delivered.
    pub fn publish(&self, event: &RealtimeEvent) -> usize {
        let handlers: Vec<Registration> = {
            let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry
                .typed
                .get(&event.event_type)
                .into_iter()
                .flatten()
                .chain(registry.wildcard.iter())
                .cloned()
                .collect()
        };

        counter!("chimera_events_published_total", "type" => event.event_type.as_str())
            .increment(1);

        handlers
            .iter()
            .filter(|registration| dispatch(registration, event))
            .count()
    }

    /// Build a timestamped event, publish it and hand it back
    pub fn emit(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
        workspace_id: Option<String>,
    ) -> RealtimeEvent {
        let mut event = RealtimeEvent::new(event_type, payload);
        event.workspace_id = workspace_id;
        self.publish(&event);
        event
    }

    /// Number of handlers registered for `event_type` (wildcards excluded)
    pub fn handler_count(&self, event_type: EventType) -> usize {
        let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.typed.get(&event_type).map_or(0, Vec::len)
    }

    /// Number of wildcard handlers
    pub fn wildcard_count(&self) -> usize {
        let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.wildcard.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch(registration: &Registration, event: &RealtimeEvent) -> bool {
    let handler = &registration.handler;
    match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(()) => true,
        Err(cause) => {
            error!(
                event_type = %event.event_type,
                subscriber = registration.id,
                "event handler panicked: {}",
                panic_message(&*cause)
            );
            counter!("chimera_event_handler_faults_total", "type" => event.event_type.as_str())
                .increment(1);
            false
        }
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    if let Some(msg) = cause.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = cause.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Capability returned by [`EventBus::subscribe`] and
/// [`EventBus::subscribe_all`]
///
/// Removes exactly its own registration, either explicitly through
/// [`unsubscribe`](Self::unsubscribe) or when dropped.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    bus: Weak<BusInner>,
    target: Target,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    fn new(bus: &Arc<BusInner>, target: Target, id: u64) -> Self {
        Self {
            bus: Arc::downgrade(bus),
            target,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Remove the handler. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.target, self.id);
            trace!(subscriber = self.id, "unsubscribed");
        }
    }

    /// Whether the handler is still registered through this capability
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Keep the handler registered for the lifetime of the bus
    pub fn detach(self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("target", &self.target)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
