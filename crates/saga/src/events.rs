//! Event contracts of the checkout saga.
//!
//! Every saga topic carries the same [`OrderData`] payload. The customer
//! snapshot is taken once, when the order is created, so no downstream step
//! needs a synchronous user lookup.

use chrono::{DateTime, Utc};
use common::{OrderId, UserId};
use domain::{Currency, Money, Order, OrderItem, PaymentMethod, Sku, StockLine};
use event_bus::{EventEnvelope, Topic};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::services::UserProfile;

/// Metadata key naming why a step failed.
pub const FAILURE_REASON: &str = "failure_reason";

/// Metadata key with a human-readable failure description.
pub const FAILURE_DETAIL: &str = "failure_detail";

/// A line of [`OrderData`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItemData {
    pub sku: Sku,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Money,
    /// quantity * unit_price.
    pub item_total: Money,
}

impl From<&OrderItem> for OrderItemData {
    fn from(item: &OrderItem) -> Self {
        Self {
            sku: item.sku.clone(),
            name: item.name.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            item_total: item.line_total(),
        }
    }
}

/// Payload of every checkout saga event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderData {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub customer: UserProfile,
    pub order_date: DateTime<Utc>,
    pub estimated_delivery: DateTime<Utc>,
    pub shipping_address: String,
    pub payment_method: PaymentMethod,
    pub payment_intent_id: Option<String>,
    pub items: Vec<OrderItemData>,
    /// Frozen order total in minor units.
    pub amount: Money,
    pub currency: Currency,
}

impl OrderData {
    /// Builds the payload of a freshly created order.
    pub fn new(order: &Order, customer: UserProfile, delivery_estimate: chrono::Duration) -> Self {
        Self {
            order_id: order.id,
            user_id: order.user_id,
            customer,
            order_date: order.created_at,
            estimated_delivery: order.created_at + delivery_estimate,
            shipping_address: order.shipping_address.clone(),
            payment_method: order.payment_method,
            payment_intent_id: order.payment_intent_id.clone(),
            items: order.items.iter().map(OrderItemData::from).collect(),
            amount: order.total,
            currency: Currency::Usd,
        }
    }

    /// Decodes the payload of a saga envelope.
    pub fn decode(envelope: &EventEnvelope) -> Result<Self> {
        Ok(envelope.decode()?)
    }

    /// Returns the stock lines the order needs.
    pub fn stock_lines(&self) -> Vec<StockLine> {
        self.items
            .iter()
            .map(|item| StockLine::new(item.sku.clone(), item.quantity))
            .collect()
    }

    /// Wraps the payload for publication on `topic`.
    ///
    /// The event id is derived from the order id and topic, so publishing the
    /// same fact again yields the same id.
    pub fn to_envelope(&self, topic: Topic) -> Result<EventEnvelope> {
        Ok(EventEnvelope::builder()
            .topic(topic)
            .key(self.order_id.to_string())
            .payload(self)?
            .build()?)
    }

    /// Wraps the payload for a failure topic, annotated with the reason.
    pub fn to_failure_envelope(
        &self,
        topic: Topic,
        reason: &str,
        detail: impl Into<String>,
    ) -> Result<EventEnvelope> {
        Ok(EventEnvelope::builder()
            .topic(topic)
            .key(self.order_id.to_string())
            .payload(self)?
            .metadata(FAILURE_REASON, serde_json::Value::from(reason))
            .metadata(FAILURE_DETAIL, serde_json::Value::from(detail.into()))
            .build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::EventId;

    fn sample() -> OrderData {
        let order = Order::new(
            OrderId::new(42),
            UserId::new(7),
            vec![
                OrderItem::new("A", "Widget A", 2, Money::from_cents(1999)),
                OrderItem::new("B", "Widget B", 1, Money::from_cents(1000)),
            ],
            "1 Main St",
            PaymentMethod::Card,
            Some("pi_1".to_string()),
        )
        .unwrap();
        OrderData::new(
            &order,
            UserProfile::new("Ada", "Lovelace", "ada@example.com"),
            chrono::Duration::hours(72),
        )
    }

    #[test]
    fn test_payload_freezes_totals() {
        let data = sample();
        assert_eq!(data.amount.cents(), 4998);
        assert_eq!(data.items[0].item_total.cents(), 3998);
        assert_eq!(
            data.estimated_delivery - data.order_date,
            chrono::Duration::hours(72)
        );
    }

    #[test]
    fn test_envelope_is_keyed_by_order() {
        let data = sample();
        let envelope = data.to_envelope(Topic::PaymentSucceeded).unwrap();

        assert_eq!(envelope.key, "42");
        assert_eq!(envelope.event_type, "payment.succeeded");
        assert_eq!(
            envelope.event_id,
            EventId::for_topic("42", Topic::PaymentSucceeded)
        );
        assert_eq!(OrderData::decode(&envelope).unwrap(), data);
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["order_id"], 42);
        assert_eq!(json["payment_method"], "CARD");
        assert_eq!(json["amount"], 4998);
        assert_eq!(json["currency"], "USD");
        assert_eq!(json["customer"]["email"], "ada@example.com");
        assert_eq!(json["items"][0]["sku"], "A");
    }

    #[test]
    fn test_failure_envelope_carries_reason() {
        let envelope = sample()
            .to_failure_envelope(Topic::PaymentFailed, "AMOUNT_MISMATCH", "expected 3000")
            .unwrap();
        assert_eq!(envelope.metadata_str(FAILURE_REASON), Some("AMOUNT_MISMATCH"));
        assert_eq!(envelope.metadata_str(FAILURE_DETAIL), Some("expected 3000"));
    }

    #[test]
    fn test_stock_lines() {
        let lines = sample().stock_lines();
        assert_eq!(lines, vec![StockLine::new("A", 2), StockLine::new("B", 1)]);
    }
}
