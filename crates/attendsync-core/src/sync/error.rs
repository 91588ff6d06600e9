use thiserror::Error;

use crate::api::ApiError;
use crate::cache::CacheError;
use crate::queue::QueueError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The queue snapshot could not be read; nothing was submitted.
    #[error("Pending queue unavailable: {0}")]
    Storage(#[from] QueueError),

    #[error("User directory fetch failed: {0}")]
    Directory(#[from] ApiError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}
