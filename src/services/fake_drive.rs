//! In-memory Drive used by unit tests.
//!
//! Follows the resumable protocol closely enough to exercise the pipeline:
//! sessions accumulate contiguous bytes, answer 308 with a `Range` header
//! until the declared total arrives, then answer 200 with file metadata.

use crate::{
    models::drive_file::DriveFile,
    services::{
        drive_client::{DriveBackend, DriveError, DriveResult, RawChunkResponse},
        transmitter::ContentRange,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};
use tokio::sync::Notify;

pub const FAKE_BASE: &str = "https://fake.drive";

struct FakeSession {
    folder_id: String,
    name: String,
    mime_type: String,
    total: u64,
    received: Vec<u8>,
    file_id: Option<String>,
}

struct StoredFile {
    folder_id: String,
    file: DriveFile,
    trashed: bool,
}

#[derive(Default)]
struct Inner {
    folders: HashMap<String, String>,
    sessions: HashMap<String, FakeSession>,
    files: Vec<StoredFile>,
    next_id: u64,
    failures: VecDeque<DriveError>,
    refuse_sessions: bool,
    ack_cap: Option<u64>,
    expired: HashSet<String>,
    put_log: Vec<String>,
    stall_skip: usize,
    stall_count: usize,
    stall_started: Arc<Notify>,
}

#[derive(Default)]
pub struct FakeDrive {
    inner: Mutex<Inner>,
}

impl FakeDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `begin_resumable` fail with a 403.
    pub fn refuse_sessions(&self) {
        self.inner.lock().unwrap().refuse_sessions = true;
    }

    /// Queue failures returned by the next `put_range` calls.
    pub fn fail_next_puts(&self, errors: impl IntoIterator<Item = DriveError>) {
        self.inner.lock().unwrap().failures.extend(errors);
    }

    /// Persist at most `bytes` of each chunk, like a backend under pressure.
    pub fn cap_ack(&self, bytes: u64) {
        self.inner.lock().unwrap().ack_cap = Some(bytes);
    }

    /// Forget a session, as if it had expired backend-side.
    /// Let `skip` PUTs through, then leave the next `count` hanging forever.
    pub fn stall_puts(&self, skip: usize, count: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.stall_skip = skip;
        inner.stall_count = count;
    }

    /// Notified each time a PUT starts hanging.
    pub fn stall_started(&self) -> Arc<Notify> {
        self.inner.lock().unwrap().stall_started.clone()
    }

    pub fn expire(&self, handle: &str) {
        self.inner.lock().unwrap().expired.insert(handle.to_string());
    }

    /// Store a file directly, bypassing any session.
    pub fn seed_file(
        &self,
        owner: &str,
        name: &str,
        size: u64,
        created: DateTime<Utc>,
    ) -> DriveFile {
        let mut inner = self.inner.lock().unwrap();
        let folder_id = folder_for(&mut inner, owner);
        let id = next_id(&mut inner, "file");
        let file = DriveFile {
            id,
            name: name.to_string(),
            mime_type: Some("video/mp4".into()),
            size: Some(size.to_string()),
            created_time: Some(created),
            modified_time: Some(created),
            ..Default::default()
        };
        inner.files.push(StoredFile {
            folder_id,
            file: file.clone(),
            trashed: false,
        });
        file
    }

    /// Open a session with `bytes` already persisted.
    pub fn seed_partial_session(&self, owner: &str, name: &str, total: u64, bytes: &[u8]) -> String {
        let mut inner = self.inner.lock().unwrap();
        let folder_id = folder_for(&mut inner, owner);
        let handle = format!("{}/upload/{}", FAKE_BASE, next_id(&mut inner, "session"));
        inner.sessions.insert(
            handle.clone(),
            FakeSession {
                folder_id,
                name: name.to_string(),
                mime_type: "video/mp4".into(),
                total,
                received: bytes.to_vec(),
                file_id: None,
            },
        );
        handle
    }

    pub fn put_log(&self) -> Vec<String> {
        self.inner.lock().unwrap().put_log.clone()
    }

    pub fn received(&self, handle: &str) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(handle)
            .map(|s| s.received.clone())
            .unwrap_or_default()
    }

    pub fn folder_count(&self) -> usize {
        self.inner.lock().unwrap().folders.len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn live_file_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .files
            .iter()
            .filter(|f| !f.trashed)
            .count()
    }
}

fn next_id(inner: &mut Inner, prefix: &str) -> String {
    inner.next_id += 1;
    format!("{}-{}", prefix, inner.next_id)
}

fn folder_for(inner: &mut Inner, owner: &str) -> String {
    if let Some(id) = inner.folders.get(owner) {
        return id.clone();
    }
    let id = next_id(inner, "folder");
    inner.folders.insert(owner.to_string(), id.clone());
    id
}

fn store_file(inner: &mut Inner, folder_id: String, name: &str, mime: &str, data: &[u8]) -> DriveFile {
    let id = next_id(inner, "file");
    // later files sort newer
    let created = Utc::now() + ChronoDuration::milliseconds(inner.next_id as i64);
    let file = DriveFile {
        id: id.clone(),
        name: name.to_string(),
        mime_type: Some(mime.to_string()),
        size: Some(data.len().to_string()),
        md5_checksum: Some(format!("{:x}", md5::compute(data))),
        web_view_link: Some(format!("https://drive.example/file/d/{}/view", id)),
        thumbnail_link: None,
        created_time: Some(created),
        modified_time: Some(created),
    };
    inner.files.push(StoredFile {
        folder_id,
        file: file.clone(),
        trashed: false,
    });
    file
}

fn ok_file(file: &DriveFile) -> RawChunkResponse {
    RawChunkResponse {
        status: 200,
        range: None,
        body: Bytes::from(serde_json::to_vec(file).unwrap()),
    }
}

fn incomplete(received: u64) -> RawChunkResponse {
    RawChunkResponse {
        status: 308,
        range: (received > 0).then(|| format!("bytes=0-{}", received - 1)),
        body: Bytes::new(),
    }
}

#[async_trait]
impl DriveBackend for FakeDrive {
    async fn ensure_owner_folder(&self, owner: &str) -> DriveResult<String> {
        let mut inner = self.inner.lock().unwrap();
        Ok(folder_for(&mut inner, owner))
    }

    async fn begin_resumable(
        &self,
        folder_id: &str,
        name: &str,
        size: u64,
        mime_type: &str,
    ) -> DriveResult<String> {
        let mut inner = self.inner.lock().unwrap();
        if inner.refuse_sessions {
            return Err(DriveError::Status {
                status: 403,
                body: "storage quota exceeded".into(),
            });
        }
        let handle = format!("{}/upload/{}", FAKE_BASE, next_id(&mut inner, "session"));
        inner.sessions.insert(
            handle.clone(),
            FakeSession {
                folder_id: folder_id.to_string(),
                name: name.to_string(),
                mime_type: mime_type.to_string(),
                total: size,
                received: Vec::new(),
                file_id: None,
            },
        );
        Ok(handle)
    }

    async fn put_range(
        &self,
        handle: &str,
        range: ContentRange,
        body: Bytes,
    ) -> DriveResult<RawChunkResponse> {
        let stalled = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stall_count == 0 {
                None
            } else if inner.stall_skip > 0 {
                inner.stall_skip -= 1;
                None
            } else {
                inner.stall_count -= 1;
                inner.put_log.push(range.to_string());
                Some(inner.stall_started.clone())
            }
        };
        if let Some(started) = stalled {
            started.notify_one();
            std::future::pending::<()>().await;
        }

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.put_log.push(range.to_string());
        if let Some(err) = inner.failures.pop_front() {
            return Err(err);
        }
        if inner.expired.contains(handle) {
            return Ok(RawChunkResponse {
                status: 404,
                range: None,
                body: Bytes::from_static(b"session expired"),
            });
        }
        let ack_cap = inner.ack_cap;

        let Some(session) = inner.sessions.get_mut(handle) else {
            return Ok(RawChunkResponse {
                status: 404,
                range: None,
                body: Bytes::from_static(b"no such session"),
            });
        };
        if let Some(file_id) = session.file_id.clone() {
            let file = inner
                .files
                .iter()
                .find(|f| f.file.id == file_id)
                .map(|f| f.file.clone())
                .unwrap();
            return Ok(ok_file(&file));
        }

        if let ContentRange::Bytes { start, .. } = range {
            let received = session.received.len() as u64;
            if start <= received {
                let skip = (received - start) as usize;
                let mut fresh = body.get(skip..).unwrap_or_default();
                if let Some(cap) = ack_cap {
                    fresh = &fresh[..fresh.len().min(cap as usize)];
                }
                session.received.extend_from_slice(fresh);
            }
        }

        let received = session.received.len() as u64;
        if received < session.total {
            return Ok(incomplete(received));
        }

        let folder_id = session.folder_id.clone();
        let name = session.name.clone();
        let mime = session.mime_type.clone();
        let data = session.received.clone();
        let file = store_file(inner, folder_id, &name, &mime, &data);
        if let Some(session) = inner.sessions.get_mut(handle) {
            session.file_id = Some(file.id.clone());
        }
        Ok(ok_file(&file))
    }

    async fn get_file(&self, file_id: &str) -> DriveResult<DriveFile> {
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .iter()
            .find(|f| f.file.id == file_id && !f.trashed)
            .map(|f| f.file.clone())
            .ok_or_else(|| DriveError::Status {
                status: 404,
                body: format!("file {} not found", file_id),
            })
    }

    async fn find_by_name(&self, folder_id: &str, name: &str) -> DriveResult<Vec<DriveFile>> {
        let inner = self.inner.lock().unwrap();
        let mut matches: Vec<DriveFile> = inner
            .files
            .iter()
            .filter(|f| f.folder_id == folder_id && f.file.name == name && !f.trashed)
            .map(|f| f.file.clone())
            .collect();
        matches.sort_by(|a, b| b.created_time.cmp(&a.created_time));
        Ok(matches)
    }

    async fn upload_single(
        &self,
        folder_id: &str,
        name: &str,
        mime_type: &str,
        body: Bytes,
    ) -> DriveResult<DriveFile> {
        let mut inner = self.inner.lock().unwrap();
        Ok(store_file(&mut inner, folder_id.to_string(), name, mime_type, &body))
    }

    async fn trash_file(&self, file_id: &str) -> DriveResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(stored) = inner.files.iter_mut().find(|f| f.file.id == file_id) {
            stored.trashed = true;
        }
        Ok(())
    }

    fn accepts_handle(&self, handle: &str) -> bool {
        handle.starts_with(&format!("{}/upload/", FAKE_BASE))
    }
}
