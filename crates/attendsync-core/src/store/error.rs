use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Local storage unavailable: {0}")]
    Unavailable(String),

    #[error("Database schema version {found} is newer than supported version {supported}; refusing to downgrade")]
    Downgrade { found: u32, supported: u32 },

    #[error("Schema migration to version {version} failed: {source}")]
    Migration {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("Invalid stored value in {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("Storage task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Store connection lock poisoned")]
    Poisoned,

    #[error("No free idempotency token for {0}")]
    TokenCollision(String),
}

impl StoreError {
    /// Whether offline capability as a whole is lost, as opposed to a single
    /// operation failing.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Downgrade { .. })
    }
}
