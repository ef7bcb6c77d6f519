use anyhow::{Context, Result, bail};
use bytes::Bytes;
use futures::StreamExt;
use media_hub::{
    build_app,
    config::{AppConfig, RunMode},
    db,
    services::{
        drive_client::GoogleDrive,
        media_service::MediaService,
        orchestrator::{FileSource, UploadEvent},
        upload_policy::UploadTier,
    },
};
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting media-hub with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    if mode == RunMode::Migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    if cfg.drive_access_token.is_empty() {
        tracing::warn!("MEDIA_HUB_DRIVE_ACCESS_TOKEN is not set; Drive calls will be rejected");
    }

    // --- Initialize core service ---
    let drive = Arc::new(GoogleDrive::new(cfg.drive_settings())?);
    let service = MediaService::new(
        db,
        drive,
        cfg.upload_policy(),
        cfg.retry_policy(),
        cfg.rate_limit(),
        cfg.chunk_timeout,
    );

    match mode {
        RunMode::Upload {
            path,
            owner,
            mime_type,
        } => upload_file(&service, &path, &owner, mime_type).await,
        _ => serve(&cfg, service).await,
    }
}

async fn serve(cfg: &AppConfig, service: MediaService) -> Result<()> {
    let app = build_app(service, cfg.max_body_bytes);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// `--upload`: push one local file through the same pipeline the API uses.
async fn upload_file(
    service: &MediaService,
    path: &Path,
    owner: &str,
    mime_type: Option<String>,
) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("upload path has no usable file name")?
        .to_string();
    let mime_type = match mime_type.or_else(|| guess_mime_type(path).map(str::to_string)) {
        Some(mime) => mime,
        None => bail!("cannot guess the MIME type of {}; pass --mime-type", file_name),
    };

    let source = FileSource::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let size = source.len();

    match service.policy.classify(size) {
        UploadTier::Manual => bail!(
            "{} is {} bytes, above the automatic upload limit; upload it through Google Drive",
            file_name,
            size
        ),
        UploadTier::Instant => {
            let body = Bytes::from(tokio::fs::read(path).await?);
            let reconciled = service
                .upload_instant(owner, &file_name, &mime_type, body)
                .await?;
            tracing::info!(
                "uploaded {} as {} ({:?})",
                file_name,
                reconciled.record.drive_file_id,
                reconciled.confidence
            );
            Ok(())
        }
        UploadTier::Chunked => {
            let session = service
                .open_local_session(owner, &file_name, size, &mime_type)
                .await?;
            tracing::info!("session opened for {} ({} bytes)", file_name, size);

            let upload = service.chunked_upload(owner, session, Arc::new(source));
            let cancel = upload.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling upload");
                    cancel.cancel();
                }
            });

            let mut events = Box::pin(upload.events());
            while let Some(event) = events.next().await {
                match event? {
                    UploadEvent::Progress(p) => tracing::info!(
                        "{:.1}% ({} / {} bytes)",
                        p.percentage,
                        p.bytes_confirmed,
                        p.total_size
                    ),
                    UploadEvent::Completed(reconciled) => tracing::info!(
                        "uploaded {} as {} ({:?})",
                        file_name,
                        reconciled.record.drive_file_id,
                        reconciled.confidence
                    ),
                }
            }
            Ok(())
        }
    }
}

fn guess_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mpeg" | "mpg" => "video/mpeg",
        "3gp" => "video/3gpp",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "ogg" | "oga" => "audio/ogg",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        _ => return None,
    };
    Some(mime)
}
