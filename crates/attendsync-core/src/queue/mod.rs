//! Durable queue of attendance marks not yet confirmed by the remote service.
//!
//! A record lives in the queue from the moment it is marked until the remote
//! confirms it or an operator discards it. Each record carries an
//! idempotency token (`<userIdentifier>-<insertMillis>`) that the remote uses
//! to absorb duplicate deliveries, so the queue can be drained any number of
//! times.
//!
//! Delivery bookkeeping (attempt count, last error, terminal rejection) is
//! stored beside the record; the record payload itself never changes.

pub mod error;
pub mod pending;

pub use error::QueueError;
pub use pending::PendingQueue;
