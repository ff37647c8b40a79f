//! HTTP route handlers.

pub mod orders;
pub mod payments;
pub mod system;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use common::UserId;

use crate::error::ApiError;

/// Header carrying the id of the calling user.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The calling user, taken from the `x-user-id` header.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ApiError::BadRequest(format!("Missing {USER_ID_HEADER} header")))?;

        value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<UserId>().ok())
            .map(Caller)
            .ok_or_else(|| ApiError::BadRequest(format!("Invalid {USER_ID_HEADER} header")))
    }
}
