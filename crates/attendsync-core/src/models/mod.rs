//! Data models for attendance synchronization.
//!
//! - `AttendanceEntry`, `AttendanceStatus`: the mutation payload a marker records
//! - `PendingRecord`, `DeliveryState`, `QueuedRecord`: queued mutations and
//!   their delivery bookkeeping
//! - `CachedUser`: a mirrored member of the remote user directory

pub mod attendance;
pub mod user;

pub use attendance::{
    idempotency_token, AttendanceEntry, AttendanceStatus, DeliveryState, DeliveryStatus,
    PendingRecord, QueuedRecord,
};
pub use user::CachedUser;
