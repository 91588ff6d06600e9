//! attendsync core library.
//!
//! Offline-first attendance capture: marks are queued durably in a local
//! SQLite store, member lookups resolve against a cached copy of the user
//! directory, and the sync engine delivers queued marks to the remote
//! service when connectivity allows.
//!
//! One [`store::StoreHandle`] is opened per session and shared by the
//! [`queue::PendingQueue`], the [`cache::UserCache`] and the
//! [`sync::SyncEngine`].

pub mod api;
pub mod cache;
pub mod config;
pub mod models;
pub mod queue;
pub mod store;
pub mod sync;
pub mod utils;

pub use api::{ApiClient, ApiError, ApplyOutcome, ApplyRequest, AttendanceRemote, UserDirectory};
pub use cache::{CacheError, CacheStatus, UserCache};
pub use config::Config;
pub use models::{AttendanceEntry, AttendanceStatus, CachedUser, PendingRecord, QueuedRecord};
pub use queue::{PendingQueue, QueueError};
pub use store::{LocalStore, StoreError, StoreHandle, StoreLocation};
pub use sync::{
    Connectivity, ConnectivityMonitor, DrainOutcome, DrainReport, ManualConnectivity, SyncEngine,
    SyncError, SyncEvent, SyncOptions,
};
