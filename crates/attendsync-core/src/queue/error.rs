use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum QueueError {
    /// The enqueue transaction aborted; the mark is not safely queued yet and
    /// the caller may retry.
    #[error("Attendance could not be queued: {0}")]
    WriteFailure(#[source] StoreError),

    #[error("Invalid attendance entry: {0}")]
    InvalidEntry(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}
