//! Order records owned by the order service.

use chrono::{DateTime, Utc};
use common::{OrderId, UserId};
use event_bus::EventEnvelope;
use serde::{Deserialize, Serialize};

use super::{OrderError, OrderStatus};
use crate::{Money, PaymentMethod, Sku};

/// A line of an order, frozen from the cart at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub sku: Sku,
    pub name: String,
    pub quantity: u32,
    /// Price per unit in cents.
    pub unit_price: Money,
}

impl OrderItem {
    /// Creates a new order item.
    pub fn new(
        sku: impl Into<Sku>,
        name: impl Into<String>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        Self {
            sku: sku.into(),
            name: name.into(),
            quantity,
            unit_price,
        }
    }

    /// Returns the total price for this line (quantity * unit_price).
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}

/// An order in the checkout saga.
///
/// The total is computed once when the order is built and never recomputed,
/// so downstream steps validate payments against the frozen value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub total: Money,
    pub shipping_address: String,
    pub payment_method: PaymentMethod,
    pub payment_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Builds a new Pending order and freezes its total.
    pub fn new(
        id: OrderId,
        user_id: UserId,
        items: Vec<OrderItem>,
        shipping_address: impl Into<String>,
        payment_method: PaymentMethod,
        payment_intent_id: Option<String>,
    ) -> Result<Self, OrderError> {
        if items.is_empty() {
            return Err(OrderError::NoItems);
        }
        if let Some(item) = items.iter().find(|item| item.quantity == 0) {
            return Err(OrderError::InvalidQuantity {
                sku: item.sku.clone(),
                quantity: item.quantity,
            });
        }

        let total = items.iter().map(OrderItem::line_total).sum();

        Ok(Self {
            id,
            user_id,
            status: OrderStatus::Pending,
            items,
            total,
            shipping_address: shipping_address.into(),
            payment_method,
            payment_intent_id,
            created_at: Utc::now(),
        })
    }

    /// Returns the number of distinct lines.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

/// A message waiting in the order outbox to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    /// Position in the outbox. Messages are published in ascending order.
    pub id: i64,
    pub order_id: OrderId,
    pub envelope: EventEnvelope,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Vec<OrderItem> {
        vec![
            OrderItem::new("A", "Widget A", 2, Money::from_cents(1999)),
            OrderItem::new("B", "Widget B", 1, Money::from_cents(1000)),
        ]
    }

    #[test]
    fn test_new_order_freezes_total() {
        let order = Order::new(
            OrderId::new(1),
            UserId::new(7),
            items(),
            "1 Main St",
            PaymentMethod::Card,
            Some("pi_1".to_string()),
        )
        .unwrap();

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total.cents(), 4998);
        assert_eq!(order.item_count(), 2);
    }

    #[test]
    fn test_new_order_requires_items() {
        let err = Order::new(
            OrderId::new(1),
            UserId::new(7),
            vec![],
            "1 Main St",
            PaymentMethod::OnDelivery,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, OrderError::NoItems));
    }

    #[test]
    fn test_new_order_rejects_zero_quantity() {
        let err = Order::new(
            OrderId::new(1),
            UserId::new(7),
            vec![OrderItem::new("A", "Widget A", 0, Money::from_cents(100))],
            "1 Main St",
            PaymentMethod::OnDelivery,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, OrderError::InvalidQuantity { quantity: 0, .. }));
    }
}
