//! Drives one chunked upload from first byte to persisted record.
//!
//! `ChunkedUpload::events` yields a finite stream: progress snapshots while
//! chunks are acknowledged, then a single `Completed` item, or one error item
//! after which the stream ends. Chunks go out strictly in order, each one
//! starting at the backend's last confirmed offset.

use crate::{
    errors::{UploadError, UploadResult},
    models::drive_file::DriveFile,
    services::{
        progress::ProgressEvent,
        reconciler::{DeclaredFile, Reconciled, Reconciler},
        retry::{RetryPolicy, with_timeout},
        session::{UploadSession, UploadState},
        transmitter::{ChunkOutcome, ChunkTransmitter, ContentRange},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, stream};
use std::{future::Future, io, path::Path, sync::Arc, time::Duration};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, SeekFrom},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive acknowledgments without progress before giving up.
const MAX_STALLED_CHUNKS: u32 = 3;

/// Random-access byte source for chunk payloads.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn read_range(&self, start: u64, end: u64) -> io::Result<Bytes>;
}

#[async_trait]
impl ChunkSource for Bytes {
    async fn read_range(&self, start: u64, end: u64) -> io::Result<Bytes> {
        if end > self.len() as u64 || start > end {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {}..{} outside {} bytes", start, end, self.len()),
            ));
        }
        Ok(self.slice(start as usize..end as usize))
    }
}

/// Reads chunks from a local file.
pub struct FileSource {
    file: Mutex<File>,
    len: u64,
}

impl FileSource {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    async fn read_range(&self, start: u64, end: u64) -> io::Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; end.saturating_sub(start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[derive(Debug, Clone)]
pub enum UploadEvent {
    Progress(ProgressEvent),
    Completed(Reconciled),
}

/// One chunked upload, ready to run.
pub struct ChunkedUpload {
    owner: String,
    session: UploadSession,
    source: Arc<dyn ChunkSource>,
    transmitter: ChunkTransmitter,
    reconciler: Reconciler,
    retry: RetryPolicy,
    chunk_size: u64,
    chunk_timeout: Duration,
    cancel: CancellationToken,
    completed: Option<DriveFile>,
    stalled: u32,
}

impl ChunkedUpload {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner: impl Into<String>,
        session: UploadSession,
        source: Arc<dyn ChunkSource>,
        transmitter: ChunkTransmitter,
        reconciler: Reconciler,
        retry: RetryPolicy,
        chunk_size: u64,
        chunk_timeout: Duration,
    ) -> Self {
        Self {
            owner: owner.into(),
            session,
            source,
            transmitter,
            reconciler,
            retry,
            chunk_size: chunk_size.max(1),
            chunk_timeout,
            cancel: CancellationToken::new(),
            completed: None,
            stalled: 0,
        }
    }

    /// Token that aborts the in-flight request and ends the stream.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    /// Consume the upload as a stream of events.
    pub fn events(self) -> impl Stream<Item = UploadResult<UploadEvent>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut upload = state?;
            match upload.step().await {
                Ok(Some(event)) => Some((Ok(event), Some(upload))),
                Ok(None) => None,
                Err(err) => {
                    upload.session.state = UploadState::Failed;
                    warn!(
                        "upload of {} failed at {} of {} bytes: {}",
                        upload.session.file_name,
                        upload.session.bytes_confirmed(),
                        upload.session.total_size(),
                        err
                    );
                    Some((Err(err), None))
                }
            }
        })
    }

    async fn step(&mut self) -> UploadResult<Option<UploadEvent>> {
        match self.session.state {
            UploadState::Idle => {
                debug!("probing session for {}", self.session.file_name);
                let total = self.session.total_size();
                let handle = &self.session.handle;
                let transmitter = &self.transmitter;
                let timeout = self.chunk_timeout;
                let outcome = cancellable(
                    &self.cancel,
                    self.retry.run("status probe", |_| {
                        with_timeout(timeout, transmitter.probe(handle, total))
                    }),
                )
                .await?;
                self.apply(outcome, true).map(Some)
            }
            UploadState::SessionCreated | UploadState::Transmitting | UploadState::RetryWait => {
                let total = self.session.total_size();
                let Some((start, end)) = self.session.progress.next_range(self.chunk_size) else {
                    return Err(UploadError::Protocol {
                        status: 308,
                        body: "backend acknowledged every byte without completing".into(),
                    });
                };
                self.session.state = UploadState::Transmitting;
                let range = ContentRange::chunk(start, end, total)?;
                let body = self.source.read_range(start, end).await?;

                let handle = &self.session.handle;
                let state = &mut self.session.state;
                let transmitter = &self.transmitter;
                let timeout = self.chunk_timeout;
                let outcome = cancellable(
                    &self.cancel,
                    self.retry.run_observed(
                        "chunk upload",
                        |_| with_timeout(timeout, transmitter.send(handle, range, body.clone())),
                        |_| *state = UploadState::RetryWait,
                    ),
                )
                .await?;
                self.apply(outcome, false).map(Some)
            }
            UploadState::BackendComplete => {
                let file = self.completed.take().ok_or_else(|| {
                    UploadError::Reconciliation("completion metadata missing".into())
                })?;
                let declared = DeclaredFile {
                    name: self.session.file_name.clone(),
                    size: self.session.total_size(),
                    mime_type: self.session.mime_type.clone(),
                };
                let reconciled = self
                    .reconciler
                    .reconcile_completed(&self.owner, file, &declared)
                    .await?;
                self.session.state = UploadState::Reconciled;
                info!(
                    "upload of {} reconciled as {}",
                    self.session.file_name, reconciled.record.id
                );
                Ok(Some(UploadEvent::Completed(reconciled)))
            }
            UploadState::Reconciled | UploadState::Failed => Ok(None),
        }
    }

    fn apply(&mut self, outcome: ChunkOutcome, probing: bool) -> UploadResult<UploadEvent> {
        match outcome {
            ChunkOutcome::Incomplete { confirmed } => {
                let moved = self.session.progress.acknowledge(confirmed);
                if moved || probing {
                    self.stalled = 0;
                } else {
                    self.stalled += 1;
                    if self.stalled >= MAX_STALLED_CHUNKS {
                        return Err(UploadError::Protocol {
                            status: 308,
                            body: format!(
                                "no progress past byte {} after {} chunks",
                                self.session.bytes_confirmed(),
                                self.stalled
                            ),
                        });
                    }
                }
                self.session.state = UploadState::Transmitting;
                debug!(
                    "{}: {} of {} bytes confirmed",
                    self.session.file_name,
                    self.session.bytes_confirmed(),
                    self.session.total_size()
                );
            }
            ChunkOutcome::Complete(file) => {
                self.session.progress.complete();
                self.session.state = UploadState::BackendComplete;
                self.completed = Some(file);
            }
        }
        Ok(UploadEvent::Progress(self.session.progress.snapshot()))
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = UploadResult<T>>,
) -> UploadResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        result = fut => result,
    }
}
