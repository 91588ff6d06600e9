use serde::{Deserialize, Serialize};

/// A member of the remote user directory, mirrored locally for offline lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct CachedUser {
    /// Directory document id.
    #[serde(default)]
    pub id: String,
    /// Primary identifier (ITS number). Unique within a snapshot.
    #[serde(rename = "itsId", default)]
    pub its_id: String,
    /// Secondary identifier. Several members may share one.
    #[serde(rename = "secondaryId", default)]
    pub secondary_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(rename = "mohallahId", default)]
    pub mohallah_id: Option<String>,
    #[serde(default)]
    pub designation: Option<String>,
    #[serde(rename = "pageRights", default)]
    pub page_rights: Vec<String>,
}

impl CachedUser {
    /// Rows without a directory id or a primary identifier cannot be resolved
    /// and are skipped on refresh.
    pub fn has_identity(&self) -> bool {
        !self.id.trim().is_empty() && !self.its_id.trim().is_empty()
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.its_id
        } else {
            &self.name
        }
    }

    pub fn has_right(&self, page: &str) -> bool {
        self.page_rights.iter().any(|r| r.eq_ignore_ascii_case(page))
    }
}
