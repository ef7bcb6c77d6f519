//! Chunk transmission against a resumable upload session.
//!
//! Sends one byte range and interprets the backend's reply. The backend's
//! `Range` acknowledgment is authoritative; nothing here advances progress
//! on the assumption that a chunk arrived.

use crate::{
    errors::{UploadError, UploadResult},
    models::drive_file::DriveFile,
    services::drive_client::{DriveBackend, RawChunkResponse},
};
use bytes::Bytes;
use std::{fmt, sync::Arc};
use tracing::debug;

/// `Content-Range` value for a chunk PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRange {
    /// `bytes {start}-{end-1}/{total}`; `end` is exclusive.
    Bytes { start: u64, end: u64, total: u64 },
    /// `bytes */{total}`: asks the backend how much it holds.
    Probe { total: u64 },
}

impl ContentRange {
    /// Build a chunk range, rejecting empty or out-of-bounds ranges.
    pub fn chunk(start: u64, end: u64, total: u64) -> UploadResult<Self> {
        if start >= end {
            return Err(UploadError::InvalidRange(format!(
                "empty chunk at offset {}",
                start
            )));
        }
        if end > total {
            return Err(UploadError::InvalidRange(format!(
                "chunk end {} exceeds total size {}",
                end, total
            )));
        }
        Ok(ContentRange::Bytes { start, end, total })
    }

    /// Parse a client-supplied header such as `bytes 0-1048575/5000000`.
    pub fn parse(value: &str) -> UploadResult<Self> {
        let invalid = || UploadError::InvalidRange(format!("malformed Content-Range `{}`", value));
        let rest = value.trim().strip_prefix("bytes ").ok_or_else(invalid)?;
        let (span, total) = rest.split_once('/').ok_or_else(invalid)?;
        let total: u64 = total.trim().parse().map_err(|_| invalid())?;
        if span.trim() == "*" {
            return Ok(ContentRange::Probe { total });
        }
        let (first, last) = span.split_once('-').ok_or_else(invalid)?;
        let first: u64 = first.trim().parse().map_err(|_| invalid())?;
        let last: u64 = last.trim().parse().map_err(|_| invalid())?;
        if last < first {
            return Err(invalid());
        }
        let end = last.checked_add(1).ok_or_else(invalid)?;
        Self::chunk(first, end, total)
    }

    pub fn total(&self) -> u64 {
        match self {
            ContentRange::Bytes { total, .. } | ContentRange::Probe { total } => *total,
        }
    }

    /// Number of payload bytes the range declares.
    pub fn len(&self) -> u64 {
        match self {
            ContentRange::Bytes { start, end, .. } => end - start,
            ContentRange::Probe { .. } => 0,
        }
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentRange::Bytes { start, end, total } => {
                write!(f, "bytes {}-{}/{}", start, end - 1, total)
            }
            ContentRange::Probe { total } => write!(f, "bytes */{}", total),
        }
    }
}

/// What the backend made of a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// More bytes expected; `confirmed` bytes are persisted.
    Incomplete { confirmed: u64 },
    /// File assembled; body is its metadata.
    Complete(DriveFile),
}

#[derive(Clone)]
pub struct ChunkTransmitter {
    backend: Arc<dyn DriveBackend>,
}

impl ChunkTransmitter {
    pub fn new(backend: Arc<dyn DriveBackend>) -> Self {
        Self { backend }
    }

    /// Send one chunk. Empty chunks and length mismatches fail before any
    /// network call.
    pub async fn send(
        &self,
        handle: &str,
        range: ContentRange,
        body: Bytes,
    ) -> UploadResult<ChunkOutcome> {
        match range {
            ContentRange::Bytes { start, end, .. } => {
                if body.is_empty() || start >= end {
                    return Err(UploadError::InvalidRange(format!(
                        "refusing to send empty chunk at offset {}",
                        start
                    )));
                }
                if body.len() as u64 != range.len() {
                    return Err(UploadError::InvalidRange(format!(
                        "body has {} bytes but range {} declares {}",
                        body.len(),
                        range,
                        range.len()
                    )));
                }
            }
            ContentRange::Probe { .. } => {
                if !body.is_empty() {
                    return Err(UploadError::InvalidRange(
                        "status probe must not carry a body".into(),
                    ));
                }
            }
        }

        debug!("PUT {}", range);
        let response = self.backend.put_range(handle, range, body).await?;
        interpret(response)
    }

    /// Ask the backend how many bytes it holds for this session.
    pub async fn probe(&self, handle: &str, total: u64) -> UploadResult<ChunkOutcome> {
        self.send(handle, ContentRange::Probe { total }, Bytes::new())
            .await
    }
}

/// Map a raw chunk response onto the protocol's three outcomes.
pub fn interpret(response: RawChunkResponse) -> UploadResult<ChunkOutcome> {
    match response.status {
        308 => {
            let confirmed = parse_confirmed(response.range.as_deref()).ok_or_else(|| {
                UploadError::Protocol {
                    status: 308,
                    body: format!(
                        "unparseable Range header `{}`",
                        response.range.as_deref().unwrap_or_default()
                    ),
                }
            })?;
            Ok(ChunkOutcome::Incomplete { confirmed })
        }
        200 | 201 => {
            let file: DriveFile =
                serde_json::from_slice(&response.body).map_err(|err| UploadError::Protocol {
                    status: response.status,
                    body: format!("malformed file metadata: {}", err),
                })?;
            Ok(ChunkOutcome::Complete(file))
        }
        status if status == 429 || status >= 500 => Err(UploadError::TransientTransport(
            format!(
                "backend returned {}: {}",
                status,
                String::from_utf8_lossy(&response.body)
            ),
        )),
        status => Err(UploadError::Protocol {
            status,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }),
    }
}

/// Bytes persisted according to a `Range: bytes=0-N` header.
///
/// A missing header means nothing is persisted yet. The range is inclusive,
/// so `bytes=0-999` is 1000 bytes.
fn parse_confirmed(range: Option<&str>) -> Option<u64> {
    let Some(range) = range else {
        return Some(0);
    };
    let end = range.trim().strip_prefix("bytes=0-")?;
    end.parse::<u64>().ok()?.checked_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::drive_client::{DriveError, DriveResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every PUT and replays canned responses.
    #[derive(Default)]
    struct ScriptedBackend {
        responses: Mutex<Vec<RawChunkResponse>>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DriveBackend for ScriptedBackend {
        async fn ensure_owner_folder(&self, _owner: &str) -> DriveResult<String> {
            Ok("folder".into())
        }
        async fn begin_resumable(&self, _: &str, _: &str, _: u64, _: &str) -> DriveResult<String> {
            Ok("handle".into())
        }
        async fn put_range(
            &self,
            _handle: &str,
            range: ContentRange,
            _body: Bytes,
        ) -> DriveResult<RawChunkResponse> {
            self.sent.lock().unwrap().push(range.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(DriveError::Network("no scripted response".into()));
            }
            Ok(responses.remove(0))
        }
        async fn get_file(&self, id: &str) -> DriveResult<DriveFile> {
            Ok(DriveFile {
                id: id.into(),
                ..Default::default()
            })
        }
        async fn find_by_name(&self, _: &str, _: &str) -> DriveResult<Vec<DriveFile>> {
            Ok(Vec::new())
        }
        async fn upload_single(&self, _: &str, _: &str, _: &str, _: Bytes) -> DriveResult<DriveFile> {
            Ok(DriveFile::default())
        }
        async fn trash_file(&self, _: &str) -> DriveResult<()> {
            Ok(())
        }
        fn accepts_handle(&self, _: &str) -> bool {
            true
        }
    }

    fn raw(status: u16, range: Option<&str>, body: &str) -> RawChunkResponse {
        RawChunkResponse {
            status,
            range: range.map(str::to_string),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn formats_and_parses_content_range() {
        let range = ContentRange::chunk(0, 10_485_760, 50_000_000).unwrap();
        assert_eq!(range.to_string(), "bytes 0-10485759/50000000");
        assert_eq!(ContentRange::parse("bytes 0-10485759/50000000").unwrap(), range);
        assert_eq!(
            ContentRange::parse("bytes */500").unwrap(),
            ContentRange::Probe { total: 500 }
        );
        assert!(ContentRange::parse("bytes 10-5/500").is_err());
        assert!(ContentRange::parse("bytes 0-600/500").is_err());
        assert!(ContentRange::parse("items 0-1/2").is_err());
    }

    #[test]
    fn range_ending_at_u64_max_is_rejected() {
        let max = u64::MAX;
        assert!(matches!(
            ContentRange::parse(&format!("bytes 0-{max}/{max}")),
            Err(UploadError::InvalidRange(msg)) if msg.contains("malformed")
        ));
        assert!(matches!(
            interpret(raw(308, Some(&format!("bytes=0-{max}")), "")),
            Err(UploadError::Protocol { status: 308, .. })
        ));
    }

    #[test]
    fn empty_ranges_are_rejected() {
        assert!(matches!(
            ContentRange::chunk(100, 100, 500),
            Err(UploadError::InvalidRange(_))
        ));
    }

    #[test]
    fn interprets_resume_incomplete() {
        let outcome = interpret(raw(308, Some("bytes=0-262143"), "")).unwrap();
        assert_eq!(outcome, ChunkOutcome::Incomplete { confirmed: 262_144 });

        let outcome = interpret(raw(308, None, "")).unwrap();
        assert_eq!(outcome, ChunkOutcome::Incomplete { confirmed: 0 });

        assert!(matches!(
            interpret(raw(308, Some("bytes=5-9"), "")),
            Err(UploadError::Protocol { status: 308, .. })
        ));
    }

    #[test]
    fn interprets_completion_and_errors() {
        let outcome = interpret(raw(200, None, r#"{"id":"f1","name":"a.mp4","size":"10"}"#)).unwrap();
        match outcome {
            ChunkOutcome::Complete(file) => assert_eq!(file.id, "f1"),
            other => panic!("expected completion, got {other:?}"),
        }

        assert!(matches!(
            interpret(raw(503, None, "busy")),
            Err(UploadError::TransientTransport(_))
        ));
        assert!(matches!(
            interpret(raw(404, None, "not found")),
            Err(UploadError::Protocol { status: 404, .. })
        ));
        assert!(matches!(
            interpret(raw(200, None, "not json")),
            Err(UploadError::Protocol { status: 200, .. })
        ));
    }

    #[tokio::test]
    async fn zero_length_chunk_never_reaches_the_network() {
        let backend = Arc::new(ScriptedBackend::default());
        let transmitter = ChunkTransmitter::new(backend.clone());

        let range = ContentRange::Bytes {
            start: 10,
            end: 10,
            total: 100,
        };
        let err = transmitter.send("handle", range, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidRange(_)));

        let range = ContentRange::chunk(0, 10, 100).unwrap();
        let err = transmitter
            .send("handle", range, Bytes::from_static(b"short"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidRange(_)));

        assert!(backend.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn probe_sends_star_range() {
        let backend = Arc::new(ScriptedBackend::default());
        backend
            .responses
            .lock()
            .unwrap()
            .push(raw(308, Some("bytes=0-99"), ""));
        let transmitter = ChunkTransmitter::new(backend.clone());

        let outcome = transmitter.probe("handle", 500).await.unwrap();
        assert_eq!(outcome, ChunkOutcome::Incomplete { confirmed: 100 });
        assert_eq!(backend.sent.lock().unwrap().as_slice(), ["bytes */500"]);
    }
}
