//! Represents an uploaded media file tracked in the local database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle status of a tracked file.
///
/// Records start as `New`; the sync pass and transcription pipeline move them
/// forward. Deleting a file through the API sets `Deleted` alongside `is_deleted`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    New,
    Processing,
    Ready,
    Deleted,
}

/// The durable artifact of a successful upload.
///
/// `drive_file_id` is unique: reconciling the same backend file twice yields
/// the same record.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Identity of the uploading user as supplied by the identity provider.
    pub owner_id: String,

    /// Identifier assigned by the storage backend.
    pub drive_file_id: String,

    /// Display name.
    pub name: String,

    pub mime_type: String,

    /// Size in bytes.
    pub size_bytes: i64,

    pub thumbnail_link: Option<String>,

    pub web_view_link: Option<String>,

    pub status: FileStatus,

    /// Soft-delete flag.
    pub is_deleted: bool,

    pub created_at: DateTime<Utc>,

    pub modified_at: DateTime<Utc>,
}
