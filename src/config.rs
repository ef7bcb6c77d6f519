use crate::services::{
    drive_client::DriveSettings,
    rate_limiter::RateLimitConfig,
    retry::RetryPolicy,
    upload_policy::{UploadPolicy, default_mime_types},
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub drive_api_base: String,
    pub drive_access_token: String,
    pub shared_drive_id: Option<String>,
    pub root_folder_id: String,
    pub instant_limit: u64,
    pub medium_limit: u64,
    pub max_file_size: u64,
    pub allowed_mime_types: Vec<String>,
    pub chunk_size: u64,
    pub chunk_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub rate_window: Duration,
    pub rate_max_uploads: u32,
    pub rate_max_bytes: u64,
    /// Upper bound on request bodies (chunks and instant uploads).
    pub max_body_bytes: usize,
}

// The access token stays out of logs.
impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("drive_api_base", &self.drive_api_base)
            .field("shared_drive_id", &self.shared_drive_id)
            .field("root_folder_id", &self.root_folder_id)
            .field("instant_limit", &self.instant_limit)
            .field("medium_limit", &self.medium_limit)
            .field("max_file_size", &self.max_file_size)
            .field("chunk_size", &self.chunk_size)
            .field("chunk_timeout", &self.chunk_timeout)
            .field("retry_attempts", &self.retry_attempts)
            .field("rate_window", &self.rate_window)
            .field("rate_max_uploads", &self.rate_max_uploads)
            .finish_non_exhaustive()
    }
}

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    Upload {
        path: PathBuf,
        owner: String,
        mime_type: Option<String>,
    },
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Media Hub resumable upload service")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_HUB_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_HUB_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides MEDIA_HUB_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Drive API root (overrides MEDIA_HUB_DRIVE_API_BASE)
    #[arg(long)]
    pub drive_api_base: Option<String>,

    /// Shared drive id (overrides MEDIA_HUB_SHARED_DRIVE_ID)
    #[arg(long)]
    pub shared_drive_id: Option<String>,

    /// Folder holding the per-owner folders (overrides MEDIA_HUB_ROOT_FOLDER_ID)
    #[arg(long)]
    pub root_folder_id: Option<String>,

    /// Largest file sent in one request (overrides MEDIA_HUB_INSTANT_LIMIT)
    #[arg(long)]
    pub instant_limit: Option<u64>,

    /// Largest file uploaded automatically (overrides MEDIA_HUB_MEDIUM_LIMIT)
    #[arg(long)]
    pub medium_limit: Option<u64>,

    /// Chunk size in bytes, rounded to 256 KiB (overrides MEDIA_HUB_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Upload a local file through the chunked pipeline and exit
    #[arg(long, value_name = "PATH", requires = "owner")]
    pub upload: Option<PathBuf>,

    /// Owner id for --upload
    #[arg(long)]
    pub owner: Option<String>,

    /// MIME type for --upload; guessed from the extension when omitted
    #[arg(long)]
    pub mime_type: Option<String>,
}

/// Read and parse `key`, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, RunMode)> {
        // --- Environment fallback ---
        let env_host = env::var("MEDIA_HUB_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("MEDIA_HUB_PORT", 3000u16)?;
        let env_db = env::var("MEDIA_HUB_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/media_hub.db".into());
        let env_api_base = env::var("MEDIA_HUB_DRIVE_API_BASE")
            .unwrap_or_else(|_| "https://www.googleapis.com".into());
        let allowed_mime_types = match env_opt("MEDIA_HUB_ALLOWED_MIME_TYPES") {
            Some(list) => list
                .split(',')
                .map(|m| m.trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            None => default_mime_types(),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            drive_api_base: args.drive_api_base.unwrap_or(env_api_base),
            drive_access_token: env::var("MEDIA_HUB_DRIVE_ACCESS_TOKEN").unwrap_or_default(),
            shared_drive_id: args
                .shared_drive_id
                .or_else(|| env_opt("MEDIA_HUB_SHARED_DRIVE_ID")),
            root_folder_id: args
                .root_folder_id
                .or_else(|| env_opt("MEDIA_HUB_ROOT_FOLDER_ID"))
                .unwrap_or_else(|| "root".into()),
            instant_limit: match args.instant_limit {
                Some(v) => v,
                None => env_or("MEDIA_HUB_INSTANT_LIMIT", 4_500_000)?,
            },
            medium_limit: match args.medium_limit {
                Some(v) => v,
                None => env_or("MEDIA_HUB_MEDIUM_LIMIT", 500_000_000)?,
            },
            max_file_size: env_or("MEDIA_HUB_MAX_FILE_SIZE", 5_000_000_000)?,
            allowed_mime_types,
            chunk_size: match args.chunk_size {
                Some(v) => v,
                None => env_or("MEDIA_HUB_CHUNK_SIZE", 10_485_760)?,
            },
            chunk_timeout: Duration::from_secs(env_or("MEDIA_HUB_CHUNK_TIMEOUT_SECS", 60)?),
            retry_attempts: env_or("MEDIA_HUB_RETRY_ATTEMPTS", 3)?,
            retry_base_delay: Duration::from_millis(env_or(
                "MEDIA_HUB_RETRY_BASE_DELAY_MS",
                1_000,
            )?),
            rate_window: Duration::from_secs(env_or("MEDIA_HUB_RATE_WINDOW_SECS", 3_600)?),
            rate_max_uploads: env_or("MEDIA_HUB_RATE_MAX_UPLOADS", 50)?,
            rate_max_bytes: env_or("MEDIA_HUB_RATE_MAX_BYTES", 10_000_000_000)?,
            max_body_bytes: env_or("MEDIA_HUB_MAX_BODY_BYTES", 16 * 1024 * 1024)?,
        };
        cfg.check()?;

        let mode = if args.migrate {
            RunMode::Migrate
        } else if let Some(path) = args.upload {
            RunMode::Upload {
                path,
                owner: args.owner.unwrap_or_default(),
                mime_type: args.mime_type,
            }
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    fn check(&self) -> Result<()> {
        if self.instant_limit > self.medium_limit {
            bail!(
                "instant limit {} exceeds medium limit {}",
                self.instant_limit,
                self.medium_limit
            );
        }
        if self.medium_limit > self.max_file_size {
            bail!(
                "medium limit {} exceeds maximum file size {}",
                self.medium_limit,
                self.max_file_size
            );
        }
        if self.chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        if self.retry_attempts == 0 {
            bail!("retry attempts must be at least 1");
        }
        // chunk and instant bodies must fit through the request body limit
        let chunk = self.upload_policy().recommended_chunk_size();
        if chunk > self.max_body_bytes as u64 {
            bail!(
                "chunk size {} exceeds the request body limit {}",
                chunk,
                self.max_body_bytes
            );
        }
        if self.instant_limit > self.max_body_bytes as u64 {
            bail!(
                "instant limit {} exceeds the request body limit {}",
                self.instant_limit,
                self.max_body_bytes
            );
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            instant_limit: self.instant_limit,
            medium_limit: self.medium_limit,
            max_file_size: self.max_file_size,
            allowed_mime_types: self.allowed_mime_types.clone(),
            chunk_size: self.chunk_size,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: self.retry_base_delay,
        }
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: self.rate_window,
            max_requests: self.rate_max_uploads,
            max_bytes: self.rate_max_bytes,
        }
    }

    pub fn drive_settings(&self) -> DriveSettings {
        DriveSettings {
            api_base: self.drive_api_base.clone(),
            access_token: self.drive_access_token.clone(),
            shared_drive_id: self.shared_drive_id.clone(),
            root_folder_id: self.root_folder_id.clone(),
            chunk_timeout: self.chunk_timeout,
        }
    }
}
