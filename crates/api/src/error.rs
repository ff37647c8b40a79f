//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::{DomainError, OrderError};
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Checkout saga error.
    Saga(SagaError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        metrics::counter!("api_errors_total", "status" => status.as_u16().to_string())
            .increment(1);

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match &err {
        SagaError::EmptyCart(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SagaError::InvalidPaymentState(_) => StatusCode::BAD_REQUEST,
        SagaError::OrderNotFound(_) => StatusCode::NOT_FOUND,
        SagaError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SagaError::Domain(DomainError::Order(
            OrderError::NoItems | OrderError::InvalidQuantity { .. },
        )) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!(error = %err, "checkout request failed");
    }
    (status, err.to_string())
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use common::{OrderId, UserId};

    fn status_of(err: SagaError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_precondition_errors() {
        assert_eq!(
            status_of(SagaError::EmptyCart(UserId::new(1))),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(SagaError::InvalidPaymentState("no intent".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_not_found_and_timeout() {
        assert_eq!(
            status_of(SagaError::OrderNotFound(OrderId::new(1))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(SagaError::Timeout {
                operation: "get_cart",
                after: Duration::from_secs(5),
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_other_errors_are_internal() {
        assert_eq!(
            status_of(SagaError::Domain(DomainError::Unavailable("orders".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
