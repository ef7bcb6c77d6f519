//! src/services/media_service.rs
//!
//! MediaService: the upload operations exposed over HTTP and the CLI.
//! Holds the SQLite pool, the Drive backend and the upload policies, and
//! composes the initiator, transmitter, retry controller and reconciler.

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        file_record::{FileRecord, FileStatus},
        upload_request::UploadRequest,
        upload_session::UploadSessionRow,
    },
    services::{
        drive_client::DriveBackend,
        orchestrator::{ChunkSource, ChunkedUpload},
        rate_limiter::{RateLimitConfig, RateLimiter},
        reconciler::{DeclaredFile, FILE_RECORD_COLUMNS, Reconciled, Reconciler},
        retry::{RetryPolicy, with_timeout},
        session::{UploadSession, open_session},
        transmitter::{ChunkOutcome, ChunkTransmitter, ContentRange},
        upload_policy::{UploadPolicy, UploadTier},
    },
};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

/// Input to [`MediaService::create_session`].
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    /// Client-chosen idempotency key.
    pub request_id: Option<String>,
}

/// An open session as handed back to the client.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub handle: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub recommended_chunk_size: u64,
    /// True when an earlier request with the same id already opened it.
    pub reused: bool,
}

/// Result of relaying one chunk to the backend.
#[derive(Debug, Clone)]
pub enum ChunkRelay {
    Incomplete { confirmed: u64 },
    Complete(Reconciled),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierInfo {
    pub tier: UploadTier,
    pub instant_limit: u64,
    pub medium_limit: u64,
    pub recommended_chunk_size: u64,
}

#[derive(Clone)]
pub struct MediaService {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
    pub drive: Arc<dyn DriveBackend>,
    pub policy: UploadPolicy,
    pub retry: RetryPolicy,
    pub chunk_timeout: Duration,
    limiter: Arc<RateLimiter>,
    transmitter: ChunkTransmitter,
    reconciler: Reconciler,
}

impl MediaService {
    pub fn new(
        db: Arc<SqlitePool>,
        drive: Arc<dyn DriveBackend>,
        policy: UploadPolicy,
        retry: RetryPolicy,
        rate_limit: RateLimitConfig,
        chunk_timeout: Duration,
    ) -> Self {
        Self {
            transmitter: ChunkTransmitter::new(drive.clone()),
            reconciler: Reconciler::new(db.clone(), drive.clone()).with_limits(retry, chunk_timeout),
            limiter: Arc::new(RateLimiter::new(rate_limit)),
            db,
            drive,
            policy,
            retry,
            chunk_timeout,
        }
    }

    pub fn tier_info(&self, file_size: u64) -> TierInfo {
        TierInfo {
            tier: self.policy.classify(file_size),
            instant_limit: self.policy.instant_limit,
            medium_limit: self.policy.medium_limit,
            recommended_chunk_size: self.policy.recommended_chunk_size(),
        }
    }

    /// Open (or re-issue) a resumable session for `owner`.
    pub async fn create_session(
        &self,
        owner: &str,
        req: SessionRequest,
    ) -> UploadResult<SessionTicket> {
        self.policy.validate(req.file_size, &req.mime_type)?;
        if self.policy.classify(req.file_size) == UploadTier::Manual {
            return Err(UploadError::Validation(format!(
                "file too large for automatic upload (over {} bytes); upload it directly through Google Drive",
                self.policy.medium_limit
            )));
        }

        let request_id = req
            .request_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        if let Some(request_id) = request_id {
            if let Some(existing) = self.find_request(owner, request_id).await? {
                return self.ticket_from_request(existing, &req);
            }
        }

        self.limiter.check_and_record(owner, req.file_size)?;
        let session = open_session(
            self.drive.as_ref(),
            &self.policy,
            owner,
            &req.file_name,
            req.file_size,
            &req.mime_type,
        )
        .await?;
        self.store_session(owner, &session, req.file_size).await?;

        if let Some(request_id) = request_id {
            sqlx::query(
                "INSERT INTO upload_requests (
                    owner_id, request_id, session_handle, file_name, file_size, mime_type, created_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(owner_id, request_id) DO NOTHING",
            )
            .bind(owner)
            .bind(request_id)
            .bind(&session.handle)
            .bind(&session.file_name)
            .bind(req.file_size as i64)
            .bind(&session.mime_type)
            .bind(Utc::now())
            .execute(&*self.db)
            .await?;

            // a concurrent duplicate may have won the insert
            if let Some(stored) = self.find_request(owner, request_id).await? {
                if stored.session_handle != session.handle {
                    return self.ticket_from_request(stored, &req);
                }
            }
        }

        Ok(SessionTicket {
            handle: session.handle,
            file_name: session.file_name,
            file_size: req.file_size,
            mime_type: session.mime_type,
            recommended_chunk_size: self.policy.recommended_chunk_size(),
            reused: false,
        })
    }

    async fn store_session(
        &self,
        owner: &str,
        session: &UploadSession,
        file_size: u64,
    ) -> UploadResult<()> {
        sqlx::query(
            "INSERT INTO upload_sessions (
                session_handle, owner_id, file_name, file_size, mime_type, created_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_handle) DO NOTHING",
        )
        .bind(&session.handle)
        .bind(owner)
        .bind(&session.file_name)
        .bind(file_size as i64)
        .bind(&session.mime_type)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// The session behind `handle`, provided `owner` opened it.
    async fn owned_session(&self, owner: &str, handle: &str) -> UploadResult<UploadSessionRow> {
        if !self.drive.accepts_handle(handle) {
            return Err(UploadError::InvalidHandle);
        }
        let row = sqlx::query_as::<_, UploadSessionRow>(
            "SELECT session_handle, owner_id, file_name, file_size, mime_type, created_at
             FROM upload_sessions WHERE session_handle = ?",
        )
        .bind(handle)
        .fetch_optional(&*self.db)
        .await?;
        match row {
            Some(row) if row.owner_id == owner => Ok(row),
            Some(_) => {
                warn!("owner {} presented a session handle opened by someone else", owner);
                Err(UploadError::InvalidHandle)
            }
            None => Err(UploadError::InvalidHandle),
        }
    }

    async fn find_request(&self, owner: &str, request_id: &str) -> UploadResult<Option<UploadRequest>> {
        let found = sqlx::query_as::<_, UploadRequest>(
            "SELECT owner_id, request_id, session_handle, file_name, file_size, mime_type, created_at
             FROM upload_requests WHERE owner_id = ? AND request_id = ?",
        )
        .bind(owner)
        .bind(request_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(found)
    }

    fn ticket_from_request(
        &self,
        stored: UploadRequest,
        req: &SessionRequest,
    ) -> UploadResult<SessionTicket> {
        if stored.file_size != req.file_size as i64 || stored.file_name != req.file_name.trim() {
            return Err(UploadError::Validation(
                "requestId was already used for a different file".into(),
            ));
        }
        info!(
            "reusing session for request {} of owner {}",
            stored.request_id, stored.owner_id
        );
        Ok(SessionTicket {
            handle: stored.session_handle,
            file_name: stored.file_name,
            file_size: req.file_size,
            mime_type: stored.mime_type,
            recommended_chunk_size: self.policy.recommended_chunk_size(),
            reused: true,
        })
    }

    /// Forward one chunk (or status probe) to the backend with retries.
    ///
    /// On completion the file is reconciled right away; `confirm_upload`
    /// remains available if the client never sees this response.
    pub async fn relay_chunk(
        &self,
        owner: &str,
        handle: &str,
        range: ContentRange,
        body: Bytes,
    ) -> UploadResult<ChunkRelay> {
        let session = self.owned_session(owner, handle).await?;
        if range.total() != session.file_size as u64 {
            return Err(UploadError::InvalidRange(format!(
                "range total {} does not match the session's {} bytes",
                range.total(),
                session.file_size
            )));
        }

        let transmitter = &self.transmitter;
        let timeout = self.chunk_timeout;
        let outcome = self
            .retry
            .run("chunk relay", |_| {
                with_timeout(timeout, transmitter.send(handle, range, body.clone()))
            })
            .await?;

        match outcome {
            ChunkOutcome::Incomplete { confirmed } => Ok(ChunkRelay::Incomplete { confirmed }),
            ChunkOutcome::Complete(file) => {
                let declared = DeclaredFile {
                    name: session.file_name,
                    size: range.total(),
                    mime_type: session.mime_type,
                };
                let reconciled = self
                    .reconciler
                    .reconcile_completed(owner, file, &declared)
                    .await?;
                Ok(ChunkRelay::Complete(reconciled))
            }
        }
    }

    /// Idempotently record the file behind a finished session.
    ///
    /// Every backend call made here is bounded by the chunk timeout.
    pub async fn confirm_upload(
        &self,
        owner: &str,
        handle: &str,
        declared: DeclaredFile,
    ) -> UploadResult<Reconciled> {
        self.owned_session(owner, handle).await?;
        self.reconciler
            .confirm(owner, handle, &declared, &self.transmitter)
            .await
    }

    /// Single-request upload for files in the instant tier.
    pub async fn upload_instant(
        &self,
        owner: &str,
        file_name: &str,
        mime_type: &str,
        body: Bytes,
    ) -> UploadResult<Reconciled> {
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(UploadError::Validation("file name is required".into()));
        }
        let size = body.len() as u64;
        self.policy.validate(size, mime_type)?;
        if self.policy.classify(size) != UploadTier::Instant {
            return Err(UploadError::Validation(format!(
                "files over {} bytes must use an upload session",
                self.policy.instant_limit
            )));
        }
        self.limiter.check_and_record(owner, size)?;

        let folder_id = self.drive.ensure_owner_folder(owner).await?;
        let digest = format!("{:x}", md5::compute(&body));
        let file = with_timeout(
            self.chunk_timeout,
            async {
                self.drive
                    .upload_single(&folder_id, file_name, mime_type, body)
                    .await
                    .map_err(UploadError::from)
            },
        )
        .await?;

        if let Some(remote) = file.md5_checksum.as_deref() {
            if !remote.eq_ignore_ascii_case(&digest) {
                warn!(
                    "checksum mismatch for {}: local {} remote {}",
                    file.id, digest, remote
                );
                if let Err(err) = self.drive.trash_file(&file.id).await {
                    warn!("could not trash corrupted upload {}: {}", file.id, err);
                }
                return Err(UploadError::TransientTransport(
                    "uploaded bytes were corrupted in transit".into(),
                ));
            }
        }

        let declared = DeclaredFile {
            name: file_name.to_string(),
            size,
            mime_type: mime_type.to_string(),
        };
        self.reconciler
            .reconcile_completed(owner, file, &declared)
            .await
    }

    /// Build a chunked upload driven from this process.
    pub fn chunked_upload(
        &self,
        owner: &str,
        session: UploadSession,
        source: Arc<dyn ChunkSource>,
    ) -> ChunkedUpload {
        ChunkedUpload::new(
            owner,
            session,
            source,
            self.transmitter.clone(),
            self.reconciler.clone(),
            self.retry,
            self.policy.recommended_chunk_size(),
            self.chunk_timeout,
        )
    }

    /// Open a session for a local upload; same checks as the HTTP path.
    pub async fn open_local_session(
        &self,
        owner: &str,
        file_name: &str,
        file_size: u64,
        mime_type: &str,
    ) -> UploadResult<UploadSession> {
        self.limiter.check_and_record(owner, file_size)?;
        let session = open_session(
            self.drive.as_ref(),
            &self.policy,
            owner,
            file_name,
            file_size,
            mime_type,
        )
        .await?;
        self.store_session(owner, &session, file_size).await?;
        Ok(session)
    }

    /// The owner's live files, newest first.
    pub async fn list_files(&self, owner: &str) -> UploadResult<Vec<FileRecord>> {
        let records = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM file_records
             WHERE owner_id = ? AND is_deleted = 0
             ORDER BY created_at DESC",
            FILE_RECORD_COLUMNS
        ))
        .bind(owner)
        .fetch_all(&*self.db)
        .await?;
        Ok(records)
    }

    /// Trash the backend file and soft-delete the record.
    pub async fn delete_file(&self, owner: &str, id: Uuid) -> UploadResult<FileRecord> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM file_records WHERE id = ? AND owner_id = ? AND is_deleted = 0",
            FILE_RECORD_COLUMNS
        ))
        .bind(id)
        .bind(owner)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| UploadError::NotFound(format!("file `{}` not found", id)))?;

        self.drive.trash_file(&record.drive_file_id).await?;

        let updated = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE file_records SET is_deleted = 1, status = ?, modified_at = ?
             WHERE id = ? RETURNING {}",
            FILE_RECORD_COLUMNS
        ))
        .bind(FileStatus::Deleted)
        .bind(Utc::now())
        .bind(record.id)
        .fetch_one(&*self.db)
        .await?;

        info!("deleted {} ({}) for owner {}", updated.name, updated.drive_file_id, owner);
        Ok(updated)
    }
}
