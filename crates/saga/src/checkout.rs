//! Wiring of the checkout saga.
//!
//! Each service listens on the topics it reacts to under its own consumer
//! group, so every topic fans out to all interested services.

use std::sync::Arc;

use domain::{OrderStore, StockLedger, TransactionStore};
use event_bus::{EventBus, Topic};

use crate::config::SagaConfig;
use crate::consumer::SagaConsumer;
use crate::error::Result;
use crate::finalizer::OrderFinalizer;
use crate::initiator::OrderInitiator;
use crate::outbox::OutboxRelay;
use crate::payment::PaymentStep;
use crate::services::{CartService, PaymentGateway, SearchIndex, UserService};
use crate::stock::StockStep;

pub const ORDER_SERVICE: &str = "order-service";
pub const PAYMENT_SERVICE: &str = "payment-service";
pub const PRODUCT_SERVICE: &str = "product-service";

/// Stores and collaborators the checkout saga runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub orders: Arc<dyn OrderStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub ledger: Arc<dyn StockLedger>,
    pub cart: Arc<dyn CartService>,
    pub users: Arc<dyn UserService>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub search: Arc<dyn SearchIndex>,
    pub bus: Arc<dyn EventBus>,
}

/// All steps of the checkout saga.
pub struct CheckoutSaga {
    pub initiator: Arc<OrderInitiator>,
    pub payment: Arc<PaymentStep>,
    pub stock: Arc<StockStep>,
    pub finalizer: Arc<OrderFinalizer>,
    pub relay: Arc<OutboxRelay>,
}

impl CheckoutSaga {
    pub fn new(collaborators: Collaborators, config: SagaConfig) -> Self {
        let Collaborators {
            orders,
            transactions,
            ledger,
            cart,
            users,
            gateway,
            search,
            bus,
        } = collaborators;

        let relay = Arc::new(OutboxRelay::new(
            orders.clone(),
            bus.clone(),
            config.call_timeout,
            config.outbox_batch_size,
        )
        .with_retention(config.outbox_retention));

        Self {
            initiator: Arc::new(OrderInitiator::new(
                orders.clone(),
                cart.clone(),
                users,
                relay.clone(),
                config.clone(),
            )),
            payment: Arc::new(PaymentStep::new(
                gateway,
                transactions,
                cart,
                bus.clone(),
                config.clone(),
            )),
            stock: Arc::new(StockStep::new(ledger, search, bus, config.clone())),
            finalizer: Arc::new(OrderFinalizer::new(orders, relay.clone(), config)),
            relay,
        }
    }

    /// Registers every step with the consumer and starts the outbox relay.
    pub async fn start(&self, consumer: &SagaConsumer) -> Result<()> {
        consumer
            .listen(PAYMENT_SERVICE, Topic::OrdersCreated, self.payment.clone())
            .await?;
        consumer
            .listen(
                PAYMENT_SERVICE,
                Topic::StockReservationFailed,
                self.payment.clone(),
            )
            .await?;

        consumer
            .listen(PRODUCT_SERVICE, Topic::PaymentSucceeded, self.stock.clone())
            .await?;
        consumer
            .listen(PRODUCT_SERVICE, Topic::PaymentFailed, self.stock.clone())
            .await?;

        for topic in [
            Topic::StockReserved,
            Topic::PaymentFailed,
            Topic::StockReservationFailed,
        ] {
            consumer
                .listen(ORDER_SERVICE, topic, self.finalizer.clone())
                .await?;
        }

        consumer.spawn_relay(self.relay.clone());
        tracing::info!("checkout saga started");
        Ok(())
    }
}
