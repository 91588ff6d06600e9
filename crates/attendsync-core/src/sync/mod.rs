//! Delivery of queued attendance to the remote service.
//!
//! The `SyncEngine` drains the pending queue with at-least-once semantics:
//! a record is removed only after the remote confirms it, and the remote
//! deduplicates by idempotency token. Transient failures leave the record
//! queued with an exponential per-record backoff; only an explicit rejection
//! from the remote is dead-lettered for an operator.
//!
//! Drains are triggered by connectivity restoration (via a
//! `ConnectivityMonitor`), by a periodic timer while online, or directly.

pub mod connectivity;
pub mod engine;
pub mod error;
pub mod report;

pub use connectivity::{Connectivity, ConnectivityMonitor, ManualConnectivity};
pub use engine::{SyncEngine, SyncOptions};
pub use error::SyncError;
pub use report::{DrainOutcome, DrainReport, RecordOutcome, SyncEvent};
