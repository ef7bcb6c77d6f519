//! Size tiers and input validation for uploads.
//!
//! Every upload path consults the same `UploadPolicy`: the browser through
//! `GET /upload-tier`, the server before opening a session, and the CLI before
//! choosing between a single-shot and a chunked transfer.

use crate::errors::{UploadError, UploadResult};
use serde::Serialize;

/// Granularity required by the resumable protocol for non-final chunks.
pub const CHUNK_GRANULARITY: u64 = 256 * 1024;

/// How a file of a given size is moved into the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadTier {
    /// Whole file in one request, no session.
    Instant,
    /// Resumable session, chunk by chunk.
    Chunked,
    /// Too large for automatic handling; upload through the provider's UI.
    Manual,
}

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub instant_limit: u64,
    pub medium_limit: u64,
    pub max_file_size: u64,
    pub allowed_mime_types: Vec<String>,
    pub chunk_size: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            instant_limit: 4_500_000,
            medium_limit: 500_000_000,
            max_file_size: 5_000_000_000,
            allowed_mime_types: default_mime_types(),
            chunk_size: 10 * 1024 * 1024,
        }
    }
}

/// Video and audio containers accepted out of the box.
pub fn default_mime_types() -> Vec<String> {
    [
        "video/mp4",
        "video/quicktime",
        "video/x-msvideo",
        "video/x-matroska",
        "video/webm",
        "video/mpeg",
        "video/3gpp",
        "audio/mpeg",
        "audio/mp4",
        "audio/x-m4a",
        "audio/wav",
        "audio/x-wav",
        "audio/webm",
        "audio/ogg",
        "audio/aac",
        "audio/flac",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl UploadPolicy {
    /// Classify a file by size. Upper bounds are closed: a file of exactly
    /// `instant_limit` bytes is `Instant`.
    pub fn classify(&self, size: u64) -> UploadTier {
        if size <= self.instant_limit {
            UploadTier::Instant
        } else if size <= self.medium_limit {
            UploadTier::Chunked
        } else {
            UploadTier::Manual
        }
    }

    /// Reject empty or oversized files and MIME types outside the allow-list.
    pub fn validate(&self, size: u64, mime_type: &str) -> UploadResult<()> {
        if size == 0 {
            return Err(UploadError::Validation("file is empty".into()));
        }
        if size > self.max_file_size {
            return Err(UploadError::Validation(format!(
                "file too large: {} bytes exceeds the {} byte maximum",
                size, self.max_file_size
            )));
        }
        let essence = mime_essence(mime_type);
        if !self
            .allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&essence))
        {
            return Err(UploadError::Validation(format!(
                "unsupported file type `{}`",
                mime_type
            )));
        }
        Ok(())
    }

    /// Chunk size advertised to clients, always a positive multiple of
    /// [`CHUNK_GRANULARITY`].
    pub fn recommended_chunk_size(&self) -> u64 {
        let rounded = self.chunk_size / CHUNK_GRANULARITY * CHUNK_GRANULARITY;
        rounded.max(CHUNK_GRANULARITY)
    }
}

/// Strip parameters (`; codecs=...`) and surrounding whitespace.
fn mime_essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
