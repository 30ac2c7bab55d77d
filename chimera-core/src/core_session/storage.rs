//! Credential storage shared by the tabs of one origin
//!
//! [`CredentialStorage`] is the "local storage" seam. [`StorageOrigin`] is an
//! in-memory origin whose tabs get cross-tab change notifications the way a
//! browser delivers `storage` events: every other tab hears about a write,
//! the writing tab does not.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

/// Storage key holding the credential token
pub const AUTH_TOKEN_KEY: &str = "auth_token";

/// Storage key holding the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Per-tab flag set when a session is invalidated, read once by the login view
pub const SESSION_INVALIDATED_FLAG: &str = "session_invalidated";

/// Route requested after an invalidation
pub const LOGIN_ROUTE: &str = "/auth/login";

const EVENT_CAPACITY: usize = 64;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage file is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A change to the shared store, as seen by another tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Changed key, or `None` when the whole store was cleared
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl StorageEvent {
    /// Whether this event can change the credential token
    pub fn touches_auth_token(&self) -> bool {
        match &self.key {
            Some(key) => key == AUTH_TOKEN_KEY,
            None => true,
        }
    }
}

/// Key-value storage persisted for the whole origin
pub trait CredentialStorage: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Notifications of writes made by other tabs, if this backend can
    /// deliver them
    fn subscribe(&self) -> Option<StorageEventReceiver> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TabId(u64);

#[derive(Debug, Clone)]
struct Envelope {
    source: TabId,
    event: StorageEvent,
}

struct OriginInner {
    values: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<Envelope>,
    next_tab: AtomicU64,
}

/// In-memory storage shared by several tabs
#[derive(Clone)]
pub struct StorageOrigin {
    inner: Arc<OriginInner>,
}

impl StorageOrigin {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(OriginInner {
                values: RwLock::new(HashMap::new()),
                events,
                next_tab: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new tab on this origin
    pub fn tab(&self) -> TabStorage {
        let id = TabId(self.inner.next_tab.fetch_add(1, Ordering::Relaxed));
        TabStorage { origin: self.inner.clone(), id }
    }

    /// Clear every key, as if done from outside any tab
    pub fn clear(&self) {
        let had_values = {
            let mut values = self.inner.values.write().unwrap_or_else(PoisonError::into_inner);
            let had_values = !values.is_empty();
            values.clear();
            had_values
        };
        if had_values {
            let event = StorageEvent { key: None, old_value: None, new_value: None };
            let _ = self.inner.events.send(Envelope { source: TabId(0), event });
        }
    }
}

impl Default for StorageOrigin {
    fn default() -> Self {
        Self::new()
    }
}

/// One tab's handle on a [`StorageOrigin`]
pub struct TabStorage {
    origin: Arc<OriginInner>,
    id: TabId,
}

impl TabStorage {
    fn write(&self, key: &str, new_value: Option<&str>) {
        let old_value = {
            let mut values = self.origin.values.write().unwrap_or_else(PoisonError::into_inner);
            match new_value {
                Some(v) => values.insert(key.to_string(), v.to_string()),
                None => values.remove(key),
            }
        };

        // Browsers only fire storage events for real changes
        if old_value.as_deref() == new_value {
            return;
        }
        let event = StorageEvent {
            key: Some(key.to_string()),
            old_value,
            new_value: new_value.map(str::to_string),
        };
        trace!(tab = self.id.0, %key, "Broadcasting storage change");
        // Nobody listening is fine
        let _ = self.origin.events.send(Envelope { source: self.id, event });
    }
}

impl CredentialStorage for TabStorage {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let values = self.origin.values.read().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.write(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.write(key, None);
        Ok(())
    }

    fn subscribe(&self) -> Option<StorageEventReceiver> {
        Some(StorageEventReceiver {
            rx: self.origin.events.subscribe(),
            own: self.id,
        })
    }
}

/// Why a storage event could not be received
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StorageRecvError {
    /// The receiver fell behind and `0` events were dropped
    #[error("missed {0} storage events")]
    Lagged(u64),

    #[error("storage origin closed")]
    Closed,
}

/// Stream of storage events written by other tabs
pub struct StorageEventReceiver {
    rx: broadcast::Receiver<Envelope>,
    own: TabId,
}

impl StorageEventReceiver {
    pub async fn recv(&mut self) -> Result<StorageEvent, StorageRecvError> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.source == self.own => continue,
                Ok(envelope) => return Ok(envelope.event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(StorageRecvError::Lagged(n))
                }
                Err(broadcast::error::RecvError::Closed) => return Err(StorageRecvError::Closed),
            }
        }
    }
}

/// Per-tab session storage for one-shot flags
#[derive(Debug, Clone, Default)]
pub struct SessionFlags(Arc<Mutex<HashSet<String>>>);

impl SessionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, flag: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(flag.to_string());
    }

    pub fn is_set(&self, flag: &str) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).contains(flag)
    }

    /// Read and clear `flag`
    pub fn take(&self, flag: &str) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).remove(flag)
    }
}
