//! REST API client module for the hosted attendance service.
//!
//! This module provides the `ApiClient` for submitting attendance entries
//! and fetching the user directory, plus the `AttendanceRemote` and
//! `UserDirectory` traits the sync engine depends on so tests can swap in
//! fakes.
//!
//! Requests carry an optional bearer token. Attendance submissions also
//! carry an `Idempotency-Key` header with the record's token.

pub mod client;
pub mod error;
pub mod remote;

pub use client::ApiClient;
pub use error::ApiError;
pub use remote::{ApplyOutcome, ApplyRequest, AttendanceRemote, UserDirectory};
