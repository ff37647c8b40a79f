//! Payment intent endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use saga::OpenedIntent;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::Caller;

/// POST /payments/intents: open a payment intent for the caller's cart total.
#[tracing::instrument(skip(state), fields(user_id = %caller.0))]
pub async fn create_intent(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<(StatusCode, Json<OpenedIntent>), ApiError> {
    let intent = state.payment.open_intent(caller.0).await?;
    Ok((StatusCode::CREATED, Json(intent)))
}
