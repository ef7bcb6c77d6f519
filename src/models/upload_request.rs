//! Idempotency entries for upload session creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A session opened on behalf of a client-supplied request id.
///
/// A retried `POST /upload-session` carrying the same `(owner_id, request_id)`
/// is answered from this row instead of opening a second backend session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadRequest {
    pub owner_id: String,
    pub request_id: String,
    pub session_handle: String,
    pub file_name: String,
    pub file_size: i64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}
