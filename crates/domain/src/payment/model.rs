use chrono::{DateTime, Utc};
use common::{OrderId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Currency, Money, PaymentMethod};

/// Status of a payment transaction.
///
/// ```text
/// Pending ──┬──► Completed ──► Refunded
///           └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl TransactionStatus {
    /// Derives the status from the state a payment gateway reports for an intent.
    pub fn from_gateway(state: &str) -> Self {
        if state == "succeeded" {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Failed
        }
    }

    /// Returns true if the transaction may move from this status to `next`.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (
                TransactionStatus::Pending,
                TransactionStatus::Completed | TransactionStatus::Failed
            ) | (TransactionStatus::Completed, TransactionStatus::Refunded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Refunded => "REFUNDED",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "COMPLETED" => Ok(TransactionStatus::Completed),
            "FAILED" => Ok(TransactionStatus::Failed),
            "REFUNDED" => Ok(TransactionStatus::Refunded),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

/// A payment transaction owned by the payment service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    /// Unset until the payment step links the transaction to an order.
    pub order_id: Option<OrderId>,
    pub user_id: UserId,
    pub amount: Money,
    pub currency: Currency,
    pub status: TransactionStatus,
    /// Payment intent id at the gateway.
    pub gateway_ref: Option<String>,
    pub payment_method: PaymentMethod,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Creates a Pending card transaction for an opened payment intent.
    pub fn card(
        user_id: UserId,
        amount: Money,
        currency: Currency,
        gateway_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: None,
            user_id,
            amount,
            currency,
            status: TransactionStatus::Pending,
            gateway_ref: Some(gateway_ref.into()),
            payment_method: PaymentMethod::Card,
            created_at: Utc::now(),
        }
    }
}

/// Result of linking a transaction to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The transaction was unlinked and now belongs to the order.
    Linked,
    /// The transaction already belonged to the order.
    AlreadyLinked,
    /// The transaction belongs to another order and was left unchanged.
    LinkedToOther(OrderId),
}
