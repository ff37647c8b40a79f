//! Order Finalizer.
//!
//! Moves Pending orders to their terminal status. Every incoming saga outcome
//! is a [`FinalizerEvent`] and [`transition`] is the single table deciding
//! what it does to an order.

use std::sync::Arc;

use async_trait::async_trait;
use common::OrderId;
use domain::{OrderStatus, OrderStore, PaymentMethod};
use event_bus::{EventEnvelope, Topic};

use crate::config::SagaConfig;
use crate::consumer::EventHandler;
use crate::error::{Result, SagaError, bounded};
use crate::events::OrderData;
use crate::outbox::OutboxRelay;

/// Saga outcomes the finalizer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerEvent {
    StockReserved { payment_method: PaymentMethod },
    PaymentFailed,
    StockReservationFailed,
}

impl FinalizerEvent {
    /// Maps a saga envelope to the event it carries.
    pub fn from_envelope(envelope: &EventEnvelope, data: &OrderData) -> Result<Self> {
        match envelope.topic()? {
            Topic::StockReserved => Ok(FinalizerEvent::StockReserved {
                payment_method: data.payment_method,
            }),
            Topic::PaymentFailed => Ok(FinalizerEvent::PaymentFailed),
            Topic::StockReservationFailed => Ok(FinalizerEvent::StockReservationFailed),
            other => Err(SagaError::UnhandledTopic(other.to_string())),
        }
    }
}

/// What an event does to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply(OrderStatus),
    /// The order is already terminal.
    Ignore,
}

/// The order status transition table.
///
/// ```text
/// Pending --stock.reserved (Card)--------------------> Paid
/// Pending --stock.reserved (OnDelivery)--------------> Confirmed
/// Pending --payment.failed | stock.reservation.failed--> Cancelled
/// terminal --any--> (ignored)
/// ```
pub fn transition(current: OrderStatus, event: FinalizerEvent) -> Transition {
    if current.is_terminal() {
        return Transition::Ignore;
    }
    match event {
        FinalizerEvent::StockReserved {
            payment_method: PaymentMethod::Card,
        } => Transition::Apply(OrderStatus::Paid),
        FinalizerEvent::StockReserved {
            payment_method: PaymentMethod::OnDelivery,
        } => Transition::Apply(OrderStatus::Confirmed),
        FinalizerEvent::PaymentFailed | FinalizerEvent::StockReservationFailed => {
            Transition::Apply(OrderStatus::Cancelled)
        }
    }
}

/// The order service's terminal step of the checkout saga.
pub struct OrderFinalizer {
    orders: Arc<dyn OrderStore>,
    relay: Arc<OutboxRelay>,
    config: SagaConfig,
}

impl OrderFinalizer {
    pub fn new(orders: Arc<dyn OrderStore>, relay: Arc<OutboxRelay>, config: SagaConfig) -> Self {
        Self {
            orders,
            relay,
            config,
        }
    }

    /// Applies an event to an order. Returns the status the event moved the
    /// order to, or None when the order was already terminal.
    #[tracing::instrument(skip(self, data), fields(order_id = %data.order_id))]
    pub async fn finalize(
        &self,
        data: &OrderData,
        event: FinalizerEvent,
    ) -> Result<Option<OrderStatus>> {
        let timeout = self.config.call_timeout;
        let order_id = data.order_id;

        let order = bounded("find_order", timeout, self.orders.find(order_id))
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))?;

        let next = match transition(order.status, event) {
            Transition::Apply(next) => next,
            Transition::Ignore => {
                tracing::debug!(status = %order.status, "order already final, event ignored");
                return Ok(None);
            }
        };

        let announcement = match next {
            OrderStatus::Paid | OrderStatus::Confirmed => {
                Some(data.to_envelope(Topic::OrdersConfirmed)?)
            }
            _ => None,
        };

        let applied = bounded(
            "update_order_status",
            timeout,
            self.orders
                .update_status_if(order_id, order.status, next, announcement),
        )
        .await?;

        if !applied {
            // Another delivery finalized the order between our read and write.
            tracing::debug!("order finalized concurrently, event ignored");
            return Ok(None);
        }

        tracing::info!(status = %next, "order finalized");
        metrics::counter!("saga_orders_finalized_total", "status" => next.as_str()).increment(1);

        if next != OrderStatus::Cancelled {
            self.flush_outbox(order_id).await;
        }

        Ok(Some(next))
    }

    async fn flush_outbox(&self, order_id: OrderId) {
        if let Err(e) = self.relay.flush().await {
            tracing::error!(
                %order_id,
                error = %e,
                "orders.confirmed not published yet, left to the outbox relay"
            );
        }
    }
}

#[async_trait]
impl EventHandler for OrderFinalizer {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<()> {
        let data = OrderData::decode(envelope)?;
        let event = FinalizerEvent::from_envelope(envelope, &data)?;
        self.finalize(&data, event).await.map(drop)
    }
}
