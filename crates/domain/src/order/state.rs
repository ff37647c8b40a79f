//! Order lifecycle state machine.

use serde::{Deserialize, Serialize};

/// The status of an order in the checkout saga.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Paid       (card, stock reserved)
///           ├──► Confirmed  (on delivery, stock reserved)
///           └──► Cancelled  (payment or stock failed)
/// ```
/// Every state other than Pending is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created by the initiator, the saga is still running.
    #[default]
    Pending,

    /// Paid by card and stock reserved (terminal state).
    Paid,

    /// Pay-on-delivery order with stock reserved (terminal state).
    Confirmed,

    /// Payment or stock reservation failed (terminal state).
    Cancelled,
}

impl OrderStatus {
    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    /// Returns true if the order may move from this state to `next`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (
                OrderStatus::Pending,
                OrderStatus::Paid | OrderStatus::Confirmed | OrderStatus::Cancelled
            )
        )
    }

    /// Returns the wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "PAID" => Ok(OrderStatus::Paid),
            "CONFIRMED" => Ok(OrderStatus::Confirmed),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}
