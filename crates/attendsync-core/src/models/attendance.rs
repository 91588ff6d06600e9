use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attendance status recorded by a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AttendanceStatus {
    #[default]
    Present,
    Late,
    Absent,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Late => "Late",
            AttendanceStatus::Absent => "Absent",
            AttendanceStatus::Excused => "Excused",
        }
    }

    /// Parse a status typed by an operator. Case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Some(AttendanceStatus::Present),
            "late" => Some(AttendanceStatus::Late),
            "absent" => Some(AttendanceStatus::Absent),
            "excused" => Some(AttendanceStatus::Excused),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The attendance mutation payload sent to the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct AttendanceEntry {
    #[serde(rename = "userIdentifier")]
    pub user_identifier: String,
    #[serde(rename = "markedAt")]
    pub marked_at: DateTime<Utc>,
    #[serde(rename = "markedBy", default)]
    pub marked_by: String,
    pub status: AttendanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "mohallahId", default, skip_serializing_if = "Option::is_none")]
    pub mohallah_id: Option<String>,
}

impl AttendanceEntry {
    pub fn new(user_identifier: impl Into<String>, status: AttendanceStatus) -> Self {
        Self {
            user_identifier: user_identifier.into(),
            marked_at: Utc::now(),
            marked_by: String::new(),
            status,
            name: None,
            mohallah_id: None,
        }
    }

    pub fn marked_by(mut self, marker: impl Into<String>) -> Self {
        self.marked_by = marker.into();
        self
    }

    pub fn marked_at(mut self, at: DateTime<Utc>) -> Self {
        self.marked_at = at;
        self
    }

    /// Carry the display name and mohallah of a resolved member.
    pub fn for_member(mut self, user: &super::CachedUser) -> Self {
        self.name = Some(user.name.clone()).filter(|n| !n.is_empty());
        self.mohallah_id = user.mohallah_id.clone();
        self
    }
}

/// Build the idempotency token for a mutation: `<userIdentifier>-<insertMillis>`.
pub fn idempotency_token(user_identifier: &str, inserted_at: DateTime<Utc>) -> String {
    format!("{}-{}", user_identifier.trim(), inserted_at.timestamp_millis())
}

/// A queued, not-yet-confirmed attendance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PendingRecord {
    pub id: i64,
    #[serde(rename = "miqaatId")]
    pub miqaat_id: String,
    pub entry: AttendanceEntry,
    #[serde(rename = "idempotencyToken")]
    pub idempotency_token: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Delivery status of a queued record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    /// Terminal: the remote rejected the entry and it awaits an operator.
    Rejected,
}

impl DeliveryStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Rejected => "rejected",
        }
    }

    /// Unknown values are not silently accepted.
    pub fn from_str_checked(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "rejected" => Some(DeliveryStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mutable delivery bookkeeping kept beside an immutable [`PendingRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct DeliveryState {
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastAttemptAt")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(rename = "rejectedReason")]
    pub rejected_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct QueuedRecord {
    pub record: PendingRecord,
    pub delivery: DeliveryState,
}
