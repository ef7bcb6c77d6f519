//! Caller identity.
//!
//! Authentication itself happens upstream; the proxy in front of this
//! service forwards the verified user id in `x-user-id`.

use crate::errors::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};

pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated owner of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

impl Owner {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Owner(v.to_string()))
            .ok_or_else(AppError::unauthorized)
    }
}
