//! Core data models for the media hub.
//!
//! `FileRecord`, `UploadRequest` and `UploadSessionRow` map to database tables via `sqlx::FromRow`;
//! `DriveFile` mirrors the storage backend's file resource as returned by its API.

pub mod drive_file;
pub mod file_record;
pub mod upload_request;
pub mod upload_session;
