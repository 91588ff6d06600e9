//! Small shared helpers: clocks and display formatting.

pub mod clock;
pub mod format;

pub use clock::{Clock, ManualClock, SystemClock};
pub use format::{format_age_minutes, format_timestamp, truncate_string};
