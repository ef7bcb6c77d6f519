//! HTTP surface of the resumable upload pipeline.
//!
//! - `POST /upload-session`   open a backend session
//! - `PUT  /upload-chunk`     relay one `Content-Range` chunk to the backend
//! - `POST /confirm-upload`   idempotently record a finished upload
//! - `POST /upload-instant`   single-request upload for small files
//! - `GET  /upload-tier`      which strategy a file size falls into

use crate::{
    errors::AppError,
    handlers::{auth::Owner, file_handlers::FileView},
    services::{
        media_service::{ChunkRelay, MediaService, SessionRequest, TierInfo},
        reconciler::{DeclaredFile, MatchConfidence, Reconciled},
        transmitter::ContentRange,
    },
};
use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_handle: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub recommended_chunk_size: u64,
    pub reused: bool,
}

/// `POST /upload-session`
pub async fn create_session(
    State(service): State<MediaService>,
    owner: Owner,
    Json(body): Json<CreateSessionBody>,
) -> Result<impl IntoResponse, AppError> {
    let ticket = service
        .create_session(
            owner.as_str(),
            SessionRequest {
                file_name: body.file_name,
                file_size: body.file_size,
                mime_type: body.mime_type,
                request_id: body.request_id,
            },
        )
        .await?;

    Ok(Json(CreateSessionResponse {
        session_handle: ticket.handle,
        file_name: ticket.file_name,
        file_size: ticket.file_size,
        mime_type: ticket.mime_type,
        recommended_chunk_size: ticket.recommended_chunk_size,
        reused: ticket.reused,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkQuery {
    pub session_handle: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IncompleteResponse {
    status: &'static str,
    bytes_confirmed: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteResponse {
    status: &'static str,
    file: FileView,
    confidence: MatchConfidence,
}

/// `PUT /upload-chunk?sessionHandle=...`
///
/// Answers 308 with the confirmed offset while the session is incomplete,
/// mirroring the backend's own resume protocol, and 200 once the file has
/// been recorded.
pub async fn upload_chunk(
    State(service): State<MediaService>,
    owner: Owner,
    Query(query): Query<ChunkQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let range = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::bad_request("missing Content-Range header"))?;
    let range = ContentRange::parse(range)?;

    let relay = service
        .relay_chunk(owner.as_str(), &query.session_handle, range, body)
        .await?;

    match relay {
        ChunkRelay::Incomplete { confirmed } => {
            let mut response = (
                StatusCode::PERMANENT_REDIRECT,
                Json(IncompleteResponse {
                    status: "incomplete",
                    bytes_confirmed: confirmed,
                }),
            )
                .into_response();
            if confirmed > 0 {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes=0-{}", confirmed - 1)) {
                    response.headers_mut().insert(header::RANGE, value);
                }
            }
            Ok(response)
        }
        ChunkRelay::Complete(reconciled) => Ok(Json(CompleteResponse {
            status: "complete",
            confidence: reconciled.confidence,
            file: reconciled.record.into(),
        })
        .into_response()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBody {
    pub session_handle: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmResponse {
    pub success: bool,
    pub file: FileView,
    pub confidence: MatchConfidence,
    /// False when the upload had already been recorded.
    pub created: bool,
}

impl From<Reconciled> for ConfirmResponse {
    fn from(reconciled: Reconciled) -> Self {
        Self {
            success: true,
            confidence: reconciled.confidence,
            created: reconciled.created,
            file: reconciled.record.into(),
        }
    }
}

/// `POST /confirm-upload`
pub async fn confirm_upload(
    State(service): State<MediaService>,
    owner: Owner,
    Json(body): Json<ConfirmBody>,
) -> Result<impl IntoResponse, AppError> {
    let reconciled = service
        .confirm_upload(
            owner.as_str(),
            &body.session_handle,
            DeclaredFile {
                name: body.file_name,
                size: body.file_size,
                mime_type: body.mime_type,
            },
        )
        .await?;
    Ok(Json(ConfirmResponse::from(reconciled)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantQuery {
    pub file_name: String,
    pub mime_type: Option<String>,
}

/// `POST /upload-instant?fileName=...&mimeType=...`
///
/// The MIME type falls back to the request's `Content-Type`.
pub async fn upload_instant(
    State(service): State<MediaService>,
    owner: Owner,
    Query(query): Query<InstantQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let mime_type = query
        .mime_type
        .or_else(|| {
            headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| AppError::bad_request("mimeType is required"))?;

    let reconciled = service
        .upload_instant(owner.as_str(), &query.file_name, &mime_type, body)
        .await?;
    Ok((StatusCode::CREATED, Json(ConfirmResponse::from(reconciled))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierQuery {
    pub file_size: u64,
}

/// `GET /upload-tier?fileSize=...`
pub async fn upload_tier(
    State(service): State<MediaService>,
    Query(query): Query<TierQuery>,
) -> Json<TierInfo> {
    Json(service.tier_info(query.file_size))
}
