//! src/services/drive_client.rs
//!
//! Google Drive access for the upload pipeline. `DriveBackend` is the seam the
//! rest of the crate talks to; `GoogleDrive` implements it over the Drive v3
//! REST API with a service-account access token against a Shared Drive.

use crate::{models::drive_file::{DriveFile, DriveFileList}, services::transmitter::ContentRange};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::{Response, StatusCode, header};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str =
    "id,name,mimeType,size,md5Checksum,thumbnailLink,webViewLink,createdTime,modifiedTime";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("drive returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode drive response ({status}): {reason}")]
    Decode { status: u16, reason: String },
    #[error("drive response missing `{0}` header")]
    MissingHeader(&'static str),
}

pub type DriveResult<T> = Result<T, DriveError>;

impl From<reqwest::Error> for DriveError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DriveError::Timeout
        } else if err.is_decode() {
            DriveError::Decode {
                status: err.status().map(|s| s.as_u16()).unwrap_or_default(),
                reason: err.to_string(),
            }
        } else {
            DriveError::Network(err.to_string())
        }
    }
}

/// Uninterpreted reply to a chunk PUT or status probe.
///
/// Status handling lives in the transmitter so every backend shares it.
#[derive(Debug, Clone)]
pub struct RawChunkResponse {
    pub status: u16,
    /// Value of the `Range` response header, e.g. `bytes=0-1048575`.
    pub range: Option<String>,
    pub body: Bytes,
}

/// Operations the upload pipeline needs from the storage backend.
#[async_trait]
pub trait DriveBackend: Send + Sync {
    /// Find or create the owner's destination folder; returns its id.
    async fn ensure_owner_folder(&self, owner: &str) -> DriveResult<String>;

    /// Open a resumable session and return its continuation handle.
    async fn begin_resumable(
        &self,
        folder_id: &str,
        name: &str,
        size: u64,
        mime_type: &str,
    ) -> DriveResult<String>;

    /// PUT a byte range (or an empty status probe) against a session.
    async fn put_range(
        &self,
        handle: &str,
        range: ContentRange,
        body: Bytes,
    ) -> DriveResult<RawChunkResponse>;

    async fn get_file(&self, file_id: &str) -> DriveResult<DriveFile>;

    /// Non-trashed files named `name` in `folder_id`, newest first.
    async fn find_by_name(&self, folder_id: &str, name: &str) -> DriveResult<Vec<DriveFile>>;

    /// Single-request upload for small files.
    async fn upload_single(
        &self,
        folder_id: &str,
        name: &str,
        mime_type: &str,
        body: Bytes,
    ) -> DriveResult<DriveFile>;

    async fn trash_file(&self, file_id: &str) -> DriveResult<()>;

    /// Whether `handle` points at this backend's upload endpoint.
    fn accepts_handle(&self, handle: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct DriveSettings {
    /// API root, `https://www.googleapis.com` in production.
    pub api_base: String,
    pub access_token: String,
    /// Shared Drive id; `None` targets the service account's own drive.
    pub shared_drive_id: Option<String>,
    /// Parent of every per-owner folder.
    pub root_folder_id: String,
    pub chunk_timeout: Duration,
}

/// Drive v3 REST client.
pub struct GoogleDrive {
    client: reqwest::Client,
    settings: DriveSettings,
    /// owner id -> folder id, filled on first lookup.
    folders: DashMap<String, String>,
}

impl GoogleDrive {
    pub fn new(settings: DriveSettings) -> DriveResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            // 308 is "resume incomplete" in the upload protocol, not a redirect
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            settings: DriveSettings {
                api_base: settings.api_base.trim_end_matches('/').to_string(),
                ..settings
            },
            folders: DashMap::new(),
        })
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.settings.api_base)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/drive/v3/files", self.settings.api_base)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.settings.access_token)
            .query(&[("supportsAllDrives", "true")])
    }

    /// Query parameters that scope `files.list` to the shared drive.
    fn list_scope(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("includeItemsFromAllDrives", "true".to_string())];
        if let Some(drive_id) = &self.settings.shared_drive_id {
            params.push(("corpora", "drive".to_string()));
            params.push(("driveId", drive_id.clone()));
        }
        params
    }

    async fn list(&self, q: String) -> DriveResult<Vec<DriveFile>> {
        let fields = format!("files({})", FILE_FIELDS);
        let response = self
            .authorized(self.client.get(self.files_url()))
            .query(&self.list_scope())
            .query(&[
                ("q", q.as_str()),
                ("fields", fields.as_str()),
                ("orderBy", "createdTime desc"),
            ])
            .send()
            .await?;
        let response = expect_success(response).await?;
        let list = decode_json::<DriveFileList>(response).await?;
        Ok(list.files)
    }

    async fn create_folder(&self, owner: &str) -> DriveResult<String> {
        let response = self
            .authorized(self.client.post(self.files_url()))
            .query(&[("fields", "id")])
            .json(&json!({
                "name": owner,
                "mimeType": FOLDER_MIME_TYPE,
                "parents": [self.settings.root_folder_id],
            }))
            .send()
            .await?;
        let response = expect_success(response).await?;
        let folder = decode_json::<DriveFile>(response).await?;
        info!("created drive folder {} for owner {}", folder.id, owner);
        Ok(folder.id)
    }
}

#[async_trait]
impl DriveBackend for GoogleDrive {
    async fn ensure_owner_folder(&self, owner: &str) -> DriveResult<String> {
        if let Some(id) = self.folders.get(owner) {
            return Ok(id.clone());
        }

        let q = format!(
            "name = '{}' and '{}' in parents and mimeType = '{}' and trashed = false",
            escape_query(owner),
            escape_query(&self.settings.root_folder_id),
            FOLDER_MIME_TYPE
        );
        let existing = self.list(q).await?;
        let folder_id = match existing.into_iter().last() {
            // oldest wins if a race ever produced two folders
            Some(folder) => folder.id,
            None => self.create_folder(owner).await?,
        };

        self.folders.insert(owner.to_string(), folder_id.clone());
        Ok(folder_id)
    }

    async fn begin_resumable(
        &self,
        folder_id: &str,
        name: &str,
        size: u64,
        mime_type: &str,
    ) -> DriveResult<String> {
        let response = self
            .authorized(self.client.post(self.upload_url()))
            .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", size.to_string())
            .json(&json!({
                "name": name,
                "mimeType": mime_type,
                "parents": [folder_id],
            }))
            .send()
            .await?;
        let response = expect_success(response).await?;
        let location = response
            .headers()
            .get(header::LOCATION)
            .ok_or(DriveError::MissingHeader("Location"))?;
        let handle = location
            .to_str()
            .map_err(|err| DriveError::Decode {
                status: response.status().as_u16(),
                reason: err.to_string(),
            })?
            .to_string();
        debug!("opened resumable session for {} ({} bytes)", name, size);
        Ok(handle)
    }

    async fn put_range(
        &self,
        handle: &str,
        range: ContentRange,
        body: Bytes,
    ) -> DriveResult<RawChunkResponse> {
        let response = self
            .client
            .put(handle)
            .bearer_auth(&self.settings.access_token)
            .header(header::CONTENT_RANGE, range.to_string())
            .header(header::CONTENT_LENGTH, body.len())
            .timeout(self.settings.chunk_timeout)
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let range = response
            .headers()
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        Ok(RawChunkResponse {
            status,
            range,
            body,
        })
    }

    async fn get_file(&self, file_id: &str) -> DriveResult<DriveFile> {
        let response = self
            .authorized(
                self.client
                    .get(format!("{}/{}", self.files_url(), file_id)),
            )
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await?;
        let response = expect_success(response).await?;
        decode_json(response).await
    }

    async fn find_by_name(&self, folder_id: &str, name: &str) -> DriveResult<Vec<DriveFile>> {
        let q = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query(name),
            escape_query(folder_id)
        );
        self.list(q).await
    }

    async fn upload_single(
        &self,
        folder_id: &str,
        name: &str,
        mime_type: &str,
        body: Bytes,
    ) -> DriveResult<DriveFile> {
        let boundary = format!("media-hub-{}", Uuid::new_v4().simple());
        let metadata = json!({
            "name": name,
            "mimeType": mime_type,
            "parents": [folder_id],
        });
        let payload = multipart_related(&boundary, &metadata, mime_type, &body);

        let response = self
            .authorized(self.client.post(self.upload_url()))
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .timeout(self.settings.chunk_timeout)
            .body(payload)
            .send()
            .await?;
        let response = expect_success(response).await?;
        decode_json(response).await
    }

    async fn trash_file(&self, file_id: &str) -> DriveResult<()> {
        let response = self
            .authorized(
                self.client
                    .patch(format!("{}/{}", self.files_url(), file_id)),
            )
            .json(&json!({ "trashed": true }))
            .send()
            .await?;
        match expect_success(response).await {
            Ok(_) => Ok(()),
            // already gone on the backend
            Err(DriveError::Status { status: 404, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn accepts_handle(&self, handle: &str) -> bool {
        let prefix = format!("{}/upload/", self.settings.api_base);
        handle.starts_with(&prefix) && !handle[prefix.len()..].contains("..")
    }
}

/// Turn a non-2xx response into `DriveError::Status` with the body attached.
async fn expect_success(response: Response) -> DriveResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DriveError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode_json<T: serde::de::DeserializeOwned>(response: Response) -> DriveResult<T> {
    let status: StatusCode = response.status();
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| DriveError::Decode {
        status: status.as_u16(),
        reason: err.to_string(),
    })
}

/// Escape a literal for use inside a single-quoted Drive query string.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn multipart_related(
    boundary: &str,
    metadata: &serde_json::Value,
    mime_type: &str,
    body: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(body.len() + 512);
    payload.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n"
        )
        .as_bytes(),
    );
    payload.extend_from_slice(format!("--{boundary}\r\nContent-Type: {mime_type}\r\n\r\n").as_bytes());
    payload.extend_from_slice(body);
    payload.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_string_contains, header, method, path, query_param},
    };

    fn drive_for(server: &MockServer) -> GoogleDrive {
        GoogleDrive::new(DriveSettings {
            api_base: server.uri(),
            access_token: "test-token".into(),
            shared_drive_id: Some("shared-1".into()),
            root_folder_id: "root-folder".into(),
            chunk_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn begin_resumable_returns_location() {
        let server = MockServer::start().await;
        let location = format!("{}/upload/drive/v3/files?upload_id=abc", server.uri());
        Mock::given(method("POST"))
            .and(path("/upload/drive/v3/files"))
            .and(query_param("uploadType", "resumable"))
            .and(header("X-Upload-Content-Length", "50000000"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).insert_header("Location", location.as_str()))
            .expect(1)
            .mount(&server)
            .await;

        let drive = drive_for(&server);
        let handle = drive
            .begin_resumable("folder-1", "clip.mp4", 50_000_000, "video/mp4")
            .await
            .unwrap();
        assert_eq!(handle, location);
        assert!(drive.accepts_handle(&handle));
    }

    #[tokio::test]
    async fn begin_resumable_without_location_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/drive/v3/files"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = drive_for(&server)
            .begin_resumable("folder-1", "clip.mp4", 10, "video/mp4")
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::MissingHeader("Location")));
    }

    #[tokio::test]
    async fn owner_folder_is_created_once_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("driveId", "shared-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "files": [] })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drive/v3/files"))
            .and(body_string_contains("root-folder"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "folder-9" })))
            .expect(1)
            .mount(&server)
            .await;

        let drive = drive_for(&server);
        assert_eq!(drive.ensure_owner_folder("user-1").await.unwrap(), "folder-9");
        assert_eq!(drive.ensure_owner_folder("user-1").await.unwrap(), "folder-9");
    }

    #[tokio::test]
    async fn existing_owner_folder_is_reused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "files": [{ "id": "folder-3", "name": "user-1" }] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drive/v3/files"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let drive = drive_for(&server);
        assert_eq!(drive.ensure_owner_folder("user-1").await.unwrap(), "folder-3");
    }

    #[tokio::test]
    async fn put_range_reports_status_and_range() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/upload/drive/v3/files"))
            .and(header("content-range", "bytes 0-9/100"))
            .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-9"))
            .expect(1)
            .mount(&server)
            .await;

        let drive = drive_for(&server);
        let handle = format!("{}/upload/drive/v3/files?upload_id=abc", server.uri());
        let range = ContentRange::chunk(0, 10, 100).unwrap();
        let response = drive
            .put_range(&handle, range, Bytes::from(vec![7u8; 10]))
            .await
            .unwrap();
        assert_eq!(response.status, 308);
        assert_eq!(response.range.as_deref(), Some("bytes=0-9"));
    }

    #[tokio::test]
    async fn single_upload_sends_multipart_related() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/drive/v3/files"))
            .and(query_param("uploadType", "multipart"))
            .and(body_string_contains("\"parents\":[\"folder-1\"]"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "file-1",
                "name": "memo.m4a",
                "mimeType": "audio/mp4",
                "size": "5"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let file = drive_for(&server)
            .upload_single("folder-1", "memo.m4a", "audio/mp4", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(file.id, "file-1");
        assert_eq!(file.size_bytes(), Some(5));
    }

    #[tokio::test]
    async fn trash_treats_missing_file_as_done() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/drive/v3/files/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(drive_for(&server).trash_file("gone").await.is_ok());
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let drive = GoogleDrive::new(DriveSettings {
            api_base: "https://www.googleapis.com/".into(),
            access_token: String::new(),
            shared_drive_id: None,
            root_folder_id: "root".into(),
            chunk_timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert!(drive.accepts_handle(
            "https://www.googleapis.com/upload/drive/v3/files?uploadType=resumable&upload_id=x"
        ));
        assert!(!drive.accepts_handle("https://evil.example.com/upload/drive/v3/files"));
        assert!(!drive.accepts_handle("https://www.googleapis.com/upload/../admin"));
        assert!(!drive.accepts_handle("http://169.254.169.254/latest"));
    }

    #[test]
    fn query_literals_are_escaped() {
        assert_eq!(escape_query("it's"), "it\\'s");
        assert_eq!(escape_query("a\\b"), "a\\\\b");
    }
}
