//! File listing and deletion, plus the JSON view of a stored file shared by
//! the upload handlers.

use crate::{
    errors::AppError,
    handlers::auth::Owner,
    models::file_record::FileRecord,
    services::media_service::MediaService,
};
use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLinks {
    pub web_view: Option<String>,
    pub thumbnail: Option<String>,
}

/// Client-facing shape of a [`FileRecord`].
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileView {
    pub id: Uuid,
    pub drive_file_id: String,
    pub name: String,
    pub size: i64,
    pub mime_type: String,
    pub links: FileLinks,
    pub created_at: DateTime<Utc>,
}

impl From<FileRecord> for FileView {
    fn from(record: FileRecord) -> Self {
        Self {
            id: record.id,
            drive_file_id: record.drive_file_id,
            name: record.name,
            size: record.size_bytes,
            mime_type: record.mime_type,
            links: FileLinks {
                web_view: record.web_view_link,
                thumbnail: record.thumbnail_link,
            },
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<FileView>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub file: FileView,
}

/// `GET /files`
pub async fn list_files(
    State(service): State<MediaService>,
    owner: Owner,
) -> Result<impl IntoResponse, AppError> {
    let files = service.list_files(owner.as_str()).await?;
    Ok(Json(FileListResponse {
        files: files.into_iter().map(FileView::from).collect(),
    }))
}

/// `DELETE /files/{id}`
pub async fn delete_file(
    State(service): State<MediaService>,
    owner: Owner,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let record = service.delete_file(owner.as_str(), id).await?;
    Ok(Json(DeleteResponse {
        success: true,
        file: record.into(),
    }))
}
