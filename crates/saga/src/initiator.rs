//! Order Saga Initiator: the synchronous entry point of checkout.

use std::sync::Arc;

use common::{OrderId, UserId};
use domain::{Order, OrderItem, OrderStatus, OrderStore, PaymentMethod};
use event_bus::Topic;
use serde::{Deserialize, Serialize};

use crate::config::SagaConfig;
use crate::error::{Result, SagaError, bounded};
use crate::events::OrderData;
use crate::outbox::OutboxRelay;
use crate::services::{CartService, UserService};

/// Request to check out the caller's current cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub user_id: UserId,
    pub shipping_address: String,
    pub payment_method: PaymentMethod,
    pub payment_intent_id: Option<String>,
}

impl CreateOrder {
    /// Creates a request for a card payment against an opened intent.
    pub fn card(
        user_id: UserId,
        shipping_address: impl Into<String>,
        payment_intent_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            shipping_address: shipping_address.into(),
            payment_method: PaymentMethod::Card,
            payment_intent_id: Some(payment_intent_id.into()),
        }
    }

    /// Creates a request for payment on delivery.
    pub fn on_delivery(user_id: UserId, shipping_address: impl Into<String>) -> Self {
        Self {
            user_id,
            shipping_address: shipping_address.into(),
            payment_method: PaymentMethod::OnDelivery,
            payment_intent_id: None,
        }
    }

    /// Checks that payment method and intent id fit together.
    pub fn validate(&self) -> Result<()> {
        match (self.payment_method, self.payment_intent_id.as_deref()) {
            (PaymentMethod::Card, Some(id)) if !id.trim().is_empty() => Ok(()),
            (PaymentMethod::Card, _) => Err(SagaError::InvalidPaymentState(
                "card payment requires a payment intent id".to_string(),
            )),
            (PaymentMethod::OnDelivery, None) => Ok(()),
            (PaymentMethod::OnDelivery, Some(_)) => Err(SagaError::InvalidPaymentState(
                "payment on delivery must not carry a payment intent id".to_string(),
            )),
        }
    }
}

/// What the caller gets back. The saga continues asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedOrder {
    pub order_id: OrderId,
    pub status: OrderStatus,
}

/// Assembles an order from the cart, commits it with its `orders.created`
/// message and hands the message to the outbox relay.
pub struct OrderInitiator {
    orders: Arc<dyn OrderStore>,
    cart: Arc<dyn CartService>,
    users: Arc<dyn UserService>,
    relay: Arc<OutboxRelay>,
    config: SagaConfig,
}

impl OrderInitiator {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        cart: Arc<dyn CartService>,
        users: Arc<dyn UserService>,
        relay: Arc<OutboxRelay>,
        config: SagaConfig,
    ) -> Self {
        Self {
            orders,
            cart,
            users,
            relay,
            config,
        }
    }

    /// Creates a Pending order from the caller's cart and starts the saga.
    ///
    /// Everything that can fail before the commit fails without side effects.
    /// After the commit the order is guaranteed to reach the bus: the relay
    /// keeps retrying its outbox message.
    #[tracing::instrument(
        skip(self, request),
        fields(user_id = %request.user_id, payment_method = %request.payment_method, order_id)
    )]
    pub async fn create_order(&self, request: CreateOrder) -> Result<CreatedOrder> {
        request.validate()?;
        let timeout = self.config.call_timeout;

        let cart = bounded("get_cart", timeout, self.cart.get_cart(request.user_id)).await?;
        if cart.is_empty() {
            return Err(SagaError::EmptyCart(request.user_id));
        }

        let profile = bounded(
            "get_profile",
            timeout,
            self.users.get_profile(request.user_id),
        )
        .await?;

        let order_id = bounded("next_order_id", timeout, self.orders.next_order_id()).await?;
        tracing::Span::current().record("order_id", tracing::field::display(order_id));

        let items = cart
            .items
            .iter()
            .map(|item| {
                OrderItem::new(
                    item.sku.clone(),
                    item.name.clone(),
                    item.quantity,
                    item.unit_price,
                )
            })
            .collect();
        let order = Order::new(
            order_id,
            request.user_id,
            items,
            request.shipping_address,
            request.payment_method,
            request.payment_intent_id,
        )
        .map_err(domain::DomainError::from)?;

        if order.total != cart.total_price {
            tracing::warn!(
                cart_total = %cart.total_price,
                order_total = %order.total,
                "cart total differs from sum of line totals"
            );
        }

        let data = OrderData::new(&order, profile, self.config.delivery_estimate);
        let envelope = data.to_envelope(Topic::OrdersCreated)?;

        bounded(
            "insert_order",
            timeout,
            self.orders.insert_with_outbox(&order, envelope),
        )
        .await?;

        metrics::counter!("saga_orders_created_total").increment(1);
        tracing::info!(total = %order.total, items = order.item_count(), "order created");

        // Not compensated: an order that is later cancelled does not restore the cart.
        if let Err(e) = bounded(
            "clear_cart",
            timeout,
            self.cart.clear_cart(request.user_id),
        )
        .await
        {
            tracing::warn!(error = %e, "failed to clear cart after checkout");
        }

        if let Err(e) = self.relay.flush().await {
            tracing::error!(
                error = %e,
                "orders.created not published yet, left to the outbox relay"
            );
        }

        Ok(CreatedOrder {
            order_id,
            status: OrderStatus::Pending,
        })
    }

    /// Loads an order to observe the saga outcome.
    pub async fn get_order(&self, order_id: OrderId) -> Result<Order> {
        bounded("find_order", self.config.call_timeout, self.orders.find(order_id))
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{CartItem, InMemoryCartService, InMemoryUserService, UserProfile};
    use domain::{InMemoryOrderStore, Money};
    use event_bus::{EventId, InMemoryEventBus};

    struct Fixture {
        initiator: OrderInitiator,
        orders: InMemoryOrderStore,
        cart: InMemoryCartService,
        users: InMemoryUserService,
        bus: InMemoryEventBus,
    }

    const USER: UserId = UserId::new(7);

    async fn fixture() -> Fixture {
        let orders = InMemoryOrderStore::new();
        let cart = InMemoryCartService::new();
        let users = InMemoryUserService::new();
        let bus = InMemoryEventBus::new();
        let config = SagaConfig::default();

        users
            .insert(USER, UserProfile::new("Ada", "Lovelace", "ada@example.com"))
            .await;
        cart.add_item(USER, CartItem::new("A", "Widget A", 2, Money::from_cents(1999)))
            .await;
        cart.add_item(USER, CartItem::new("B", "Widget B", 1, Money::from_cents(1000)))
            .await;

        let relay = Arc::new(OutboxRelay::new(
            Arc::new(orders.clone()),
            Arc::new(bus.clone()),
            config.call_timeout,
            config.outbox_batch_size,
        ));
        let initiator = OrderInitiator::new(
            Arc::new(orders.clone()),
            Arc::new(cart.clone()),
            Arc::new(users.clone()),
            relay,
            config,
        );

        Fixture {
            initiator,
            orders,
            cart,
            users,
            bus,
        }
    }

    #[tokio::test]
    async fn creates_pending_order_and_publishes() {
        let f = fixture().await;

        let created = f
            .initiator
            .create_order(CreateOrder::card(USER, "1 Main St", "pi_1"))
            .await
            .unwrap();

        assert_eq!(created.status, OrderStatus::Pending);
        let order = f.initiator.get_order(created.order_id).await.unwrap();
        assert_eq!(order.total.cents(), 4998);
        assert!(f.cart.items(USER).await.is_empty());

        let published = f.bus.published(Topic::OrdersCreated);
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].event_id,
            EventId::for_topic(&created.order_id.to_string(), Topic::OrdersCreated)
        );
        let data = OrderData::decode(&published[0]).unwrap();
        assert_eq!(data.payment_intent_id.as_deref(), Some("pi_1"));
        assert_eq!(data.customer.first_name, "Ada");
        assert_eq!(data.amount.cents(), 4998);
    }

    #[tokio::test]
    async fn empty_cart_is_rejected() {
        let f = fixture().await;
        let err = f
            .initiator
            .create_order(CreateOrder::on_delivery(UserId::new(99), "1 Main St"))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::EmptyCart(_)));
        assert!(f.orders.is_empty().await);
    }

    #[tokio::test]
    async fn payment_state_is_checked_first() {
        let f = fixture().await;

        let mut card_without_intent = CreateOrder::card(USER, "1 Main St", "pi_1");
        card_without_intent.payment_intent_id = None;
        let err = f
            .initiator
            .create_order(card_without_intent)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidPaymentState(_)));

        let mut on_delivery_with_intent = CreateOrder::on_delivery(USER, "1 Main St");
        on_delivery_with_intent.payment_intent_id = Some("pi_1".to_string());
        let err = f
            .initiator
            .create_order(on_delivery_with_intent)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidPaymentState(_)));

        assert!(f.orders.is_empty().await);
        assert_eq!(f.cart.items(USER).await.len(), 2);
    }

    #[tokio::test]
    async fn profile_failure_leaves_no_order() {
        let f = fixture().await;
        f.users.set_fail_on_get(true).await;

        let err = f
            .initiator
            .create_order(CreateOrder::on_delivery(USER, "1 Main St"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(f.orders.is_empty().await);
        assert_eq!(f.cart.items(USER).await.len(), 2);
    }

    #[tokio::test]
    async fn cart_clear_failure_does_not_fail_checkout() {
        let f = fixture().await;
        f.cart.set_fail_on_clear(true).await;

        let created = f
            .initiator
            .create_order(CreateOrder::on_delivery(USER, "1 Main St"))
            .await
            .unwrap();
        assert_eq!(created.status, OrderStatus::Pending);
        assert_eq!(f.bus.published(Topic::OrdersCreated).len(), 1);
    }

    #[tokio::test]
    async fn publish_failure_keeps_message_in_outbox() {
        let f = fixture().await;
        f.bus.set_fail_on_publish(true);

        let created = f
            .initiator
            .create_order(CreateOrder::on_delivery(USER, "1 Main St"))
            .await
            .unwrap();

        let pending = f.orders.pending_outbox(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].order_id, created.order_id);
        assert!(f.bus.published(Topic::OrdersCreated).is_empty());
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let f = fixture().await;
        let err = f.initiator.get_order(OrderId::new(404)).await.unwrap_err();
        assert!(matches!(err, SagaError::OrderNotFound(_)));
    }
}
