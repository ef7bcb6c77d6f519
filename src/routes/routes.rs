//! Routes of the media upload API.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST   /upload-session`: open a resumable session
//!   - `PUT    /upload-chunk`: relay one chunk (`?sessionHandle=`)
//!   - `POST   /confirm-upload`: record a finished upload (idempotent)
//!   - `POST   /upload-instant`: single-request upload for small files
//!   - `GET    /upload-tier`: strategy for a file size (`?fileSize=`)
//!
//! - **File endpoints**
//!   - `GET    /files`: the caller's files, newest first
//!   - `DELETE /files/{id}`: trash and soft-delete one file

use crate::{
    handlers::{
        file_handlers::{delete_file, list_files},
        health_handlers::{healthz, readyz},
        upload_handlers::{confirm_upload, create_session, upload_chunk, upload_instant, upload_tier},
    },
    services::media_service::MediaService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
};

/// Build the router; `max_body` bounds chunk and instant-upload bodies.
pub fn routes(max_body: usize) -> Router<MediaService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/upload-session", post(create_session))
        .route("/upload-chunk", put(upload_chunk))
        .route("/confirm-upload", post(confirm_upload))
        .route("/upload-instant", post(upload_instant))
        .route("/upload-tier", get(upload_tier))
        .route("/files", get(list_files))
        .route("/files/{id}", delete(delete_file))
        .layer(DefaultBodyLimit::max(max_body))
}
