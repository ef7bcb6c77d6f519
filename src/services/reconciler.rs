//! src/services/reconciler.rs
//!
//! Turns a finished backend upload into a durable `FileRecord`.
//!
//! Records are keyed by the backend file id, so confirming the same file any
//! number of times returns the same row. When the completion response was
//! lost, the session is probed for its final metadata; if the session is gone
//! too, the owner's folder is searched by name as a degraded fallback.

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        drive_file::DriveFile,
        file_record::{FileRecord, FileStatus},
    },
    services::{
        drive_client::DriveBackend,
        retry::{RetryPolicy, with_timeout},
        transmitter::{ChunkOutcome, ChunkTransmitter},
    },
};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) const FILE_RECORD_COLUMNS: &str = "id, owner_id, drive_file_id, name, mime_type, size_bytes, \
     thumbnail_link, web_view_link, status, is_deleted, created_at, modified_at";

/// What the client declared when it started the upload.
#[derive(Debug, Clone)]
pub struct DeclaredFile {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// How confidently the backend file was identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    /// Metadata came straight from the backend's completion response.
    Direct,
    /// Found by name search; exactly one candidate.
    NameMatch,
    /// Found by name search among several candidates; newest was chosen.
    Ambiguous,
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub record: FileRecord,
    /// False when the record already existed.
    pub created: bool,
    pub confidence: MatchConfidence,
}

#[derive(Clone)]
pub struct Reconciler {
    db: Arc<SqlitePool>,
    drive: Arc<dyn DriveBackend>,
    retry: RetryPolicy,
    /// Bound on each backend call made while reconciling.
    call_timeout: Duration,
}

impl Reconciler {
    pub fn new(db: Arc<SqlitePool>, drive: Arc<dyn DriveBackend>) -> Self {
        Self {
            db,
            drive,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(60),
        }
    }

    /// Retry policy for status checks and the timeout for every backend call.
    pub fn with_limits(mut self, retry: RetryPolicy, call_timeout: Duration) -> Self {
        self.retry = retry;
        self.call_timeout = call_timeout;
        self
    }

    /// Persist a file the backend reported as complete.
    ///
    /// Canonical metadata is re-fetched when possible; the completion body is
    /// used as-is if that lookup fails.
    pub async fn reconcile_completed(
        &self,
        owner: &str,
        file: DriveFile,
        declared: &DeclaredFile,
    ) -> UploadResult<Reconciled> {
        if file.id.is_empty() {
            return Err(UploadError::Reconciliation(
                "completion response carried no file id".into(),
            ));
        }
        let lookup = with_timeout(self.call_timeout, async {
            self.drive.get_file(&file.id).await.map_err(UploadError::from)
        });
        let canonical = match lookup.await {
            Ok(canonical) => canonical,
            Err(err) => {
                debug!("metadata lookup for {} failed, using completion body: {}", file.id, err);
                file
            }
        };
        self.record(owner, &canonical, declared, MatchConfidence::Direct)
            .await
    }

    /// Confirm a session whose completion response may have been lost.
    ///
    /// Safe to call repeatedly. Transient status failures are retried and,
    /// once the budget is spent, surface as `TransientTransport`. The name
    /// search runs only when the backend says the session no longer exists.
    /// Fails with `Reconciliation` when no file can be located; the transfer
    /// itself is never retried from here.
    pub async fn confirm(
        &self,
        owner: &str,
        handle: &str,
        declared: &DeclaredFile,
        transmitter: &ChunkTransmitter,
    ) -> UploadResult<Reconciled> {
        let timeout = self.call_timeout;
        let status = self
            .retry
            .run("session status", |_| {
                with_timeout(timeout, transmitter.probe(handle, declared.size))
            })
            .await;
        match status {
            Ok(ChunkOutcome::Complete(file)) => {
                return self.reconcile_completed(owner, file, declared).await;
            }
            Ok(ChunkOutcome::Incomplete { confirmed }) => {
                return Err(UploadError::Reconciliation(format!(
                    "upload still in progress: {} of {} bytes received",
                    confirmed, declared.size
                )));
            }
            Err(UploadError::Protocol {
                status: status @ (404 | 410),
                ..
            }) => {
                debug!("session gone ({}), falling back to name search", status);
            }
            Err(err) => return Err(err),
        }

        let (file, confidence) = self.search_by_name(owner, declared).await?;
        self.record(owner, &file, declared, confidence).await
    }

    /// Look the file up in the owner's folder by name.
    async fn search_by_name(
        &self,
        owner: &str,
        declared: &DeclaredFile,
    ) -> UploadResult<(DriveFile, MatchConfidence)> {
        let folder_id = with_timeout(self.call_timeout, async {
            self.drive
                .ensure_owner_folder(owner)
                .await
                .map_err(|err| UploadError::Reconciliation(err.to_string()))
        })
        .await?;
        let candidates = with_timeout(self.call_timeout, async {
            self.drive
                .find_by_name(&folder_id, &declared.name)
                .await
                .map_err(|err| UploadError::Reconciliation(err.to_string()))
        })
        .await?;

        let (file, count) = pick_candidate(candidates, declared.size).ok_or_else(|| {
            UploadError::Reconciliation(format!(
                "no file named `{}` found in the destination folder",
                declared.name
            ))
        })?;

        let confidence = if count > 1 {
            warn!(
                "{} files named `{}` match for owner {}; choosing newest {}",
                count, declared.name, owner, file.id
            );
            MatchConfidence::Ambiguous
        } else {
            MatchConfidence::NameMatch
        };
        Ok((file, confidence))
    }

    /// Insert the record unless the backend id is already known.
    async fn record(
        &self,
        owner: &str,
        file: &DriveFile,
        declared: &DeclaredFile,
        confidence: MatchConfidence,
    ) -> UploadResult<Reconciled> {
        let now = Utc::now();
        let name = if file.name.is_empty() {
            declared.name.clone()
        } else {
            file.name.clone()
        };
        let mime_type = file
            .mime_type
            .clone()
            .unwrap_or_else(|| declared.mime_type.clone());
        let size_bytes = file.size_bytes().unwrap_or(declared.size as i64);

        let inserted = sqlx::query(
            r#"
            INSERT INTO file_records (
                id, owner_id, drive_file_id, name, mime_type, size_bytes,
                thumbnail_link, web_view_link, status, is_deleted, created_at, modified_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(drive_file_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner)
        .bind(&file.id)
        .bind(&name)
        .bind(&mime_type)
        .bind(size_bytes)
        .bind(&file.thumbnail_link)
        .bind(&file.web_view_link)
        .bind(FileStatus::New)
        .bind(file.created_time.unwrap_or(now))
        .bind(file.modified_time.unwrap_or(now))
        .execute(&*self.db)
        .await?;

        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM file_records WHERE drive_file_id = ?",
            FILE_RECORD_COLUMNS
        ))
        .bind(&file.id)
        .fetch_one(&*self.db)
        .await?;

        let created = inserted.rows_affected() == 1;
        if created {
            info!(
                "recorded {} ({} bytes) as {} for owner {}",
                record.name, record.size_bytes, record.id, owner
            );
        } else {
            debug!("drive file {} already recorded as {}", file.id, record.id);
        }

        Ok(Reconciled {
            record,
            created,
            confidence,
        })
    }
}

/// Prefer candidates whose size matches the declared size, then the newest.
/// Returns the pick and how many candidates were equally plausible.
fn pick_candidate(candidates: Vec<DriveFile>, declared_size: u64) -> Option<(DriveFile, usize)> {
    let sized: Vec<DriveFile> = candidates
        .iter()
        .filter(|f| f.size_bytes() == Some(declared_size as i64))
        .cloned()
        .collect();
    let mut pool = if sized.is_empty() { candidates } else { sized };
    let count = pool.len();
    pool.sort_by(|a, b| b.created_time.cmp(&a.created_time));
    pool.into_iter().next().map(|file| (file, count))
}
