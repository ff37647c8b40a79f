use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use event_bus::EventEnvelope;

use super::{Order, OrderStatus, OutboxMessage};
use crate::Result;

/// Storage owned by the order service.
///
/// Every write that must be announced on the bus takes the envelope along, and
/// the store commits the row change and the outbox entry in one transaction.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Reserves the id of the next order.
    async fn next_order_id(&self) -> Result<OrderId>;

    /// Persists a new order together with its outbox message.
    async fn insert_with_outbox(&self, order: &Order, outbox: EventEnvelope) -> Result<()>;

    /// Loads an order by id.
    async fn find(&self, id: OrderId) -> Result<Option<Order>>;

    /// Moves an order from `expected` to `next` status.
    ///
    /// Returns false without writing anything when the current status is not
    /// `expected`. The optional outbox message is committed with the update.
    async fn update_status_if(
        &self,
        id: OrderId,
        expected: OrderStatus,
        next: OrderStatus,
        outbox: Option<EventEnvelope>,
    ) -> Result<bool>;

    /// Returns up to `limit` unpublished outbox messages, oldest first.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Marks an outbox message as published.
    async fn mark_outbox_published(&self, id: i64) -> Result<()>;

    /// Deletes outbox messages published before `published_before`.
    ///
    /// Unpublished messages are never deleted. Returns how many were removed.
    async fn purge_published_outbox(&self, published_before: DateTime<Utc>) -> Result<u64>;
}
