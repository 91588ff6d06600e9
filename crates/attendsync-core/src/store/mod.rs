//! Durable, transactional local storage.
//!
//! `LocalStore` owns the location of the SQLite database and hands out a
//! single live [`StoreHandle`] per session. The handle is shared by the
//! pending queue, the user cache and the sync engine; every mutation goes
//! through [`StoreHandle::write`], which commits or rolls back as a unit.
//!
//! SQLite work is synchronous, so each transaction runs on Tokio's blocking
//! pool. The connection mutex is taken inside the blocking task and never
//! held across an await.

pub mod error;
pub mod schema;

pub use error::StoreError;
pub use schema::SCHEMA_VERSION;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

/// How long a statement waits on a locked database file before failing.
const BUSY_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    InMemory,
}

/// Owner of the session's store handle.
pub struct LocalStore {
    location: StoreLocation,
    handle: tokio::sync::Mutex<Option<StoreHandle>>,
}

impl LocalStore {
    pub fn new(location: StoreLocation) -> Self {
        Self {
            location,
            handle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreLocation::InMemory)
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Open the store, running any pending schema upgrade.
    ///
    /// Safe to call repeatedly: after the first success every call returns a
    /// clone of the same live handle until [`LocalStore::close`].
    pub async fn open(&self) -> Result<StoreHandle, StoreError> {
        let mut slot = self.handle.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        let location = self.location.clone();
        let handle = tokio::task::spawn_blocking(move || StoreHandle::connect(&location)).await??;
        info!(location = ?self.location, "Local store opened");

        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Drop the cached handle. Clones still held elsewhere stay usable until
    /// they are dropped; the next `open` reconnects.
    pub async fn close(&self) {
        if self.handle.lock().await.take().is_some() {
            info!("Local store closed");
        }
    }
}

/// Shared handle to the open database. Clone is cheap.
#[derive(Clone)]
pub struct StoreHandle {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}

impl StoreHandle {
    fn connect(location: &StoreLocation) -> Result<Self, StoreError> {
        let mut conn = match location {
            StoreLocation::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::Unavailable(format!(
                            "cannot create {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
                let conn = Connection::open(path).map_err(|e| {
                    StoreError::Unavailable(format!("cannot open {}: {}", path.display(), e))
                })?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })
                .map_err(|e| StoreError::Unavailable(format!("cannot enable WAL: {}", e)))?;
                conn
            }
            StoreLocation::InMemory => Connection::open_in_memory()
                .map_err(|e| StoreError::Unavailable(e.to_string()))?,
        };

        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let version = schema::migrate(&mut conn)?;
        debug!(version, "Store schema ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Whether two handles share the same connection.
    pub fn ptr_eq(&self, other: &StoreHandle) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }

    /// Run `f` inside a read transaction; every statement sees one snapshot.
    pub async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.run(TransactionBehavior::Deferred, f).await
    }

    /// Run `f` inside a write transaction. Commits if `f` returns `Ok`, rolls
    /// back otherwise.
    pub async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        self.run(TransactionBehavior::Immediate, f).await
    }

    async fn run<T, F>(&self, behavior: TransactionBehavior, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            let tx = guard.transaction_with_behavior(behavior)?;
            // Dropping `tx` on the error path rolls it back
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await?
    }

    pub async fn schema_version(&self) -> Result<u32, StoreError> {
        self.read(|tx| schema::current_version(tx)).await
    }
}

pub(crate) fn to_millis(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or(StoreError::InvalidTimestamp(ms))
}
