pub mod drive_client;
pub mod media_service;
pub mod orchestrator;
pub mod progress;
pub mod rate_limiter;
pub mod reconciler;
pub mod retry;
pub mod session;
pub mod transmitter;
pub mod upload_policy;

#[cfg(test)]
pub(crate) mod fake_drive;
