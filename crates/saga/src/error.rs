//! Saga error types.

use std::future::Future;
use std::time::Duration;

use common::{OrderId, UserId};
use domain::DomainError;
use event_bus::EventBusError;
use thiserror::Error;

/// Errors that can occur while running the checkout saga.
///
/// Validation failures (amount mismatch, insufficient stock) are not errors:
/// they end a step with a failure event. Errors are what the caller or the
/// consumer runtime has to deal with.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The caller's cart has no items.
    #[error("Cart of user {0} is empty")]
    EmptyCart(UserId),

    /// Payment method and payment intent do not fit together.
    #[error("Invalid payment state: {0}")]
    InvalidPaymentState(String),

    /// The order is unknown to the order store.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// A blocking call did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// An external collaborator (cart, user, gateway, search) failed.
    #[error("{service} service error: {reason}")]
    Collaborator {
        service: &'static str,
        reason: String,
    },

    /// Event bus error.
    #[error("Event bus error: {0}")]
    Bus(#[from] EventBusError),

    /// Store error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A handler received a topic it is not wired for.
    #[error("Unhandled topic: {0}")]
    UnhandledTopic(String),
}

impl SagaError {
    pub(crate) fn collaborator(service: &'static str, reason: impl Into<String>) -> Self {
        SagaError::Collaborator {
            service,
            reason: reason.into(),
        }
    }

    /// Returns true when redelivering the message may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::Timeout { .. } | SagaError::Collaborator { .. } => true,
            SagaError::Bus(e) => matches!(
                e,
                EventBusError::PublishFailed { .. }
                    | EventBusError::SubscriptionFailed { .. }
                    | EventBusError::SettlementFailed(_)
                    | EventBusError::Broker(_)
                    | EventBusError::Database(_)
            ),
            SagaError::Domain(e) => e.is_transient(),
            SagaError::EmptyCart(_)
            | SagaError::InvalidPaymentState(_)
            | SagaError::OrderNotFound(_)
            | SagaError::Serialization(_)
            | SagaError::UnhandledTopic(_) => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

/// Runs a blocking call under a timeout.
pub(crate) async fn bounded<T, E, F>(operation: &'static str, after: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    SagaError: From<E>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result.map_err(SagaError::from),
        Err(_) => Err(SagaError::Timeout { operation, after }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(
            SagaError::Timeout {
                operation: "get_intent",
                after: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(SagaError::collaborator("gateway", "503").is_transient());
        assert!(SagaError::Domain(DomainError::Unavailable("orders".into())).is_transient());
        assert!(!SagaError::OrderNotFound(OrderId::new(1)).is_transient());
        assert!(!SagaError::Bus(EventBusError::UnknownTopic("x".into())).is_transient());
        assert!(!SagaError::UnhandledTopic("x".into()).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let err = bounded("slow_call", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, SagaError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            SagaError::Timeout {
                operation: "slow_call",
                ..
            }
        ));
    }
}
