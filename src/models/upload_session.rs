//! Ownership of open upload sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A backend session handle together with the owner it was opened for.
///
/// Chunks and confirmations for a handle are accepted only from this owner,
/// and the declared file details come from here rather than from the client.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSessionRow {
    pub session_handle: String,
    pub owner_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}
