use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use event_bus::EventEnvelope;
use tokio::sync::RwLock;

use super::{Order, OrderError, OrderStatus, OrderStore, OutboxMessage};
use crate::{DomainError, Result};

#[derive(Default)]
struct State {
    next_id: i64,
    orders: HashMap<OrderId, Order>,
    outbox: BTreeMap<i64, (OutboxMessage, Option<DateTime<Utc>>)>,
    next_outbox_id: i64,
    fail_writes: bool,
}

impl State {
    fn push_outbox(&mut self, order_id: OrderId, envelope: EventEnvelope) {
        self.next_outbox_id += 1;
        let id = self.next_outbox_id;
        let message = OutboxMessage {
            id,
            order_id,
            envelope,
            created_at: Utc::now(),
        };
        self.outbox.insert(id, (message, None));
    }

    fn check_available(&self) -> Result<()> {
        if self.fail_writes {
            return Err(DomainError::Unavailable("order store".to_string()));
        }
        Ok(())
    }
}

/// In-memory order store for testing and development.
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures writes to fail with a transient error.
    pub async fn set_fail_writes(&self, fail: bool) {
        self.state.write().await.fail_writes = fail;
    }

    /// Returns every retained outbox message, published or not.
    pub async fn outbox(&self) -> Vec<OutboxMessage> {
        self.state
            .read()
            .await
            .outbox
            .values()
            .map(|(message, _)| message.clone())
            .collect()
    }

    /// Returns the number of stored orders.
    pub async fn len(&self) -> usize {
        self.state.read().await.orders.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.orders.is_empty()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn next_order_id(&self) -> Result<OrderId> {
        let mut state = self.state.write().await;
        state.next_id += 1;
        Ok(OrderId::new(state.next_id))
    }

    async fn insert_with_outbox(&self, order: &Order, outbox: EventEnvelope) -> Result<()> {
        let mut state = self.state.write().await;
        state.check_available()?;

        if state.orders.contains_key(&order.id) {
            return Err(OrderError::Duplicate(order.id).into());
        }

        state.orders.insert(order.id, order.clone());
        state.push_outbox(order.id, outbox);
        Ok(())
    }

    async fn find(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(&id).cloned())
    }

    async fn update_status_if(
        &self,
        id: OrderId,
        expected: OrderStatus,
        next: OrderStatus,
        outbox: Option<EventEnvelope>,
    ) -> Result<bool> {
        if !expected.can_transition_to(next) {
            return Err(OrderError::InvalidTransition {
                from: expected,
                to: next,
            }
            .into());
        }

        let mut state = self.state.write().await;
        state.check_available()?;

        let order = state.orders.get_mut(&id).ok_or(OrderError::NotFound(id))?;
        if order.status != expected {
            return Ok(false);
        }
        order.status = next;

        if let Some(envelope) = outbox {
            state.push_outbox(id, envelope);
        }
        Ok(true)
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        Ok(self
            .state
            .read()
            .await
            .outbox
            .values()
            .filter(|(_, published_at)| published_at.is_none())
            .take(limit)
            .map(|(message, _)| message.clone())
            .collect())
    }

    async fn mark_outbox_published(&self, id: i64) -> Result<()> {
        if let Some((_, published_at)) = self.state.write().await.outbox.get_mut(&id) {
            published_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn purge_published_outbox(&self, published_before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.outbox.len();
        state
            .outbox
            .retain(|_, (_, published_at)| published_at.is_none_or(|at| at >= published_before));
        Ok((before - state.outbox.len()) as u64)
    }
}
