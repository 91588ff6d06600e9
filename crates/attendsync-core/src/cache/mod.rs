//! Local snapshot of the remote user directory for offline lookups.
//!
//! This module provides the `UserCache`, a wholesale-replaceable mirror of
//! the directory stored in the local store. A refresh clears and repopulates
//! the snapshot inside one write transaction, so a reader sees either the old
//! generation or the new one, never a mixture.
//!
//! The snapshot is considered stale after 60 minutes by default.

pub mod manager;

pub use manager::{CacheError, CacheStatus, UserCache, DEFAULT_STALE_MINUTES};
