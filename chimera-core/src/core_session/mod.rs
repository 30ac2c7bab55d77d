//! Session consistency across tabs
//!
//! Credential storage shared by every tab of an origin, the router seam and
//! the [`SessionConsistencyCoordinator`] that discards local state when the
//! stored token changes underneath a tab.

pub mod coordinator;
pub mod file_storage;
pub mod navigator;
pub mod storage;

pub use coordinator::{InvalidationReason, SessionConsistencyCoordinator, SessionWatchState};
pub use file_storage::FileStorage;
pub use navigator::{LoggingNavigator, Navigator, RecordingNavigator};
pub use storage::{
    CredentialStorage, SessionFlags, StorageError, StorageEvent, StorageEventReceiver,
    StorageOrigin, StorageRecvError, StorageResult, TabStorage, AUTH_TOKEN_KEY, LOGIN_ROUTE,
    REFRESH_TOKEN_KEY, SESSION_INVALIDATED_FLAG,
};
