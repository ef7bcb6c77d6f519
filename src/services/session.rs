//! Resumable upload sessions and the initiator that opens them.

use crate::{
    errors::{UploadError, UploadResult},
    services::{drive_client::DriveBackend, progress::ProgressTracker, upload_policy::UploadPolicy},
};
use serde::Serialize;
use tracing::info;

/// Where one upload attempt stands.
///
/// ```text
/// Idle -> SessionCreated -> [Transmitting <-> RetryWait]* -> BackendComplete -> Reconciled
///                                  |
///                                  v
///                               Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Idle,
    SessionCreated,
    Transmitting,
    RetryWait,
    BackendComplete,
    Reconciled,
    Failed,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Reconciled | UploadState::Failed)
    }
}

/// One in-progress resumable transfer.
///
/// `handle` is a capability: whoever holds it can write to the session.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub handle: String,
    pub file_name: String,
    pub mime_type: String,
    pub progress: ProgressTracker,
    pub state: UploadState,
}

impl UploadSession {
    pub fn new(handle: String, file_name: String, mime_type: String, total_size: u64) -> Self {
        Self {
            handle,
            file_name,
            mime_type,
            progress: ProgressTracker::new(total_size),
            state: UploadState::SessionCreated,
        }
    }

    /// Re-enter a session after an interruption. Progress restarts at zero
    /// until a status probe reports what the backend holds.
    pub fn resume(handle: String, file_name: String, mime_type: String, total_size: u64) -> Self {
        let mut session = Self::new(handle, file_name, mime_type, total_size);
        session.state = UploadState::Idle;
        session
    }

    pub fn total_size(&self) -> u64 {
        self.progress.total()
    }

    pub fn bytes_confirmed(&self) -> u64 {
        self.progress.confirmed()
    }
}

/// Validate the request, resolve the owner's folder and open a backend session.
///
/// Validation fails before any network call. Any backend failure here is a
/// `SessionCreation` error; retries only apply once a session exists.
pub async fn open_session(
    backend: &dyn DriveBackend,
    policy: &UploadPolicy,
    owner: &str,
    file_name: &str,
    file_size: u64,
    mime_type: &str,
) -> UploadResult<UploadSession> {
    let file_name = file_name.trim();
    if file_name.is_empty() {
        return Err(UploadError::Validation("file name is required".into()));
    }
    policy.validate(file_size, mime_type)?;

    let folder_id = backend
        .ensure_owner_folder(owner)
        .await
        .map_err(|err| UploadError::SessionCreation(format!("destination folder: {}", err)))?;

    let handle = backend
        .begin_resumable(&folder_id, file_name, file_size, mime_type)
        .await
        .map_err(|err| UploadError::SessionCreation(err.to_string()))?;
    if handle.is_empty() {
        return Err(UploadError::SessionCreation(
            "backend returned an empty session handle".into(),
        ));
    }

    info!(
        "opened upload session for {} ({} bytes, {}) owned by {}",
        file_name, file_size, mime_type, owner
    );
    Ok(UploadSession::new(
        handle,
        file_name.to_string(),
        mime_type.to_string(),
        file_size,
    ))
}
