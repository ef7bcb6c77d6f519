//! Media Hub: resumable media uploads into per-user Google Drive folders.
//!
//! The binary serves the HTTP API from [`routes`]; the same pipeline is
//! available in-process through [`services::media_service::MediaService`].

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use services::media_service::MediaService;

/// The full router with `service` as shared state.
pub fn build_app(service: MediaService, max_body: usize) -> Router {
    routes::routes::routes(max_body).with_state(service)
}
