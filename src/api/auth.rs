//! Caller identity.
//!
//! Authentication happens upstream; the already-authenticated user id arrives
//! in the `x-user-id` header.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated user making the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Unauthorized(format!("missing {} header", USER_ID_HEADER)))?;

        Ok(AuthUser(user_id.to_string()))
    }
}
