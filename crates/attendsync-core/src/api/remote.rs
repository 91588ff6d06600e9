//! Contracts for the remote collaborators the sync engine talks to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{AttendanceEntry, CachedUser, PendingRecord};

use super::ApiError;

/// Body submitted to the remote apply-attendance operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRequest {
    #[serde(rename = "miqaatId")]
    pub miqaat_id: String,
    pub entry: AttendanceEntry,
    #[serde(rename = "idempotencyToken")]
    pub idempotency_token: String,
}

impl From<&PendingRecord> for ApplyRequest {
    fn from(record: &PendingRecord) -> Self {
        Self {
            miqaat_id: record.miqaat_id.clone(),
            entry: record.entry.clone(),
            idempotency_token: record.idempotency_token.clone(),
        }
    }
}

/// What the remote did with a submitted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Accepted,
    /// The token was seen before; the earlier application stands.
    AlreadyApplied,
    /// Permanent validation failure. Resubmitting will not help.
    Rejected { reason: String },
}

/// Remote apply-attendance operation. Implementations must be idempotent on
/// the request's token.
#[async_trait]
pub trait AttendanceRemote: Send + Sync {
    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome, ApiError>;
}

/// Full snapshot fetch of the remote user directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn fetch_users(&self) -> Result<Vec<CachedUser>, ApiError>;
}
