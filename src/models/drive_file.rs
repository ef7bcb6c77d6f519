//! File resource as reported by the Drive API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical metadata for a file stored in the backend.
///
/// Drive encodes `size` as a decimal string; use [`DriveFile::size_bytes`].
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub mime_type: Option<String>,

    #[serde(default)]
    pub size: Option<String>,

    #[serde(default)]
    pub md5_checksum: Option<String>,

    #[serde(default)]
    pub thumbnail_link: Option<String>,

    #[serde(default)]
    pub web_view_link: Option<String>,

    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
}

impl DriveFile {
    /// Parsed byte size, if the backend reported one.
    pub fn size_bytes(&self) -> Option<i64> {
        self.size.as_deref().and_then(|s| s.parse().ok())
    }
}

/// Envelope returned by `files.list`.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DriveFileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
}
