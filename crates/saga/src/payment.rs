//! Payment Saga Step.
//!
//! Validates the payment of a created order against the gateway and
//! publishes `payment.succeeded` or `payment.failed`. Also opens payment
//! intents before checkout and refunds card payments whose stock
//! reservation failed.

use std::sync::Arc;

use async_trait::async_trait;
use common::{OrderId, UserId};
use domain::{
    Currency, LinkOutcome, Money, PaymentMethod, Transaction, TransactionStatus, TransactionStore,
};
use event_bus::{EventBus, EventEnvelope, Topic};
use serde::{Deserialize, Serialize};

use crate::config::SagaConfig;
use crate::consumer::EventHandler;
use crate::error::{Result, SagaError, bounded};
use crate::events::OrderData;
use crate::services::{CartService, PaymentGateway};

/// Why a payment was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentFailure {
    /// A card order arrived without a payment intent id.
    MissingPaymentIntent,
    /// Neither the gateway nor the transaction store know the intent.
    UnknownPaymentIntent(String),
    /// The intent authorizes a different amount than the order total.
    AmountMismatch { expected: Money, actual: Money },
    /// The intent already paid for another order.
    IntentAlreadyUsed { order_id: OrderId },
    /// The gateway did not report the intent as succeeded.
    Declined { status: TransactionStatus },
}

impl PaymentFailure {
    /// Returns the `failure_reason` code published with `payment.failed`.
    pub fn code(&self) -> &'static str {
        match self {
            PaymentFailure::MissingPaymentIntent => "MISSING_PAYMENT_INTENT",
            PaymentFailure::UnknownPaymentIntent(_) => "UNKNOWN_PAYMENT_INTENT",
            PaymentFailure::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            PaymentFailure::IntentAlreadyUsed { .. } => "INTENT_ALREADY_USED",
            PaymentFailure::Declined { .. } => "PAYMENT_DECLINED",
        }
    }
}

impl std::fmt::Display for PaymentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentFailure::MissingPaymentIntent => f.write_str("card order has no payment intent"),
            PaymentFailure::UnknownPaymentIntent(id) => write!(f, "unknown payment intent {id}"),
            PaymentFailure::AmountMismatch { expected, actual } => {
                write!(f, "order total {expected} does not match intent amount {actual}")
            }
            PaymentFailure::IntentAlreadyUsed { order_id } => {
                write!(f, "payment intent already used by order {order_id}")
            }
            PaymentFailure::Declined { status } => write!(f, "payment ended as {status}"),
        }
    }
}

/// Result of validating the payment of an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded,
    Failed(PaymentFailure),
}

/// Result of the refund compensation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    /// The charge was refunded.
    Refunded { refund_id: String },
    /// Nothing was charged, or the charge was already refunded.
    NotRequired,
}

/// An intent opened for the caller's cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenedIntent {
    pub intent_id: String,
    pub client_secret: String,
    pub amount: Money,
    pub currency: Currency,
}

/// The payment service's part of the checkout saga.
pub struct PaymentStep {
    gateway: Arc<dyn PaymentGateway>,
    transactions: Arc<dyn TransactionStore>,
    cart: Arc<dyn CartService>,
    bus: Arc<dyn EventBus>,
    config: SagaConfig,
}

impl PaymentStep {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        transactions: Arc<dyn TransactionStore>,
        cart: Arc<dyn CartService>,
        bus: Arc<dyn EventBus>,
        config: SagaConfig,
    ) -> Self {
        Self {
            gateway,
            transactions,
            cart,
            bus,
            config,
        }
    }

    /// Opens a payment intent for the current total of the caller's cart and
    /// records it as a Pending card transaction.
    #[tracing::instrument(skip(self), fields(%user_id))]
    pub async fn open_intent(&self, user_id: UserId) -> Result<OpenedIntent> {
        let timeout = self.config.call_timeout;

        let cart = bounded("get_cart", timeout, self.cart.get_cart(user_id)).await?;
        if cart.is_empty() {
            return Err(SagaError::EmptyCart(user_id));
        }

        let amount = cart.line_total();
        let currency = Currency::Usd;
        let created = bounded(
            "create_intent",
            timeout,
            self.gateway.create_intent(amount, currency),
        )
        .await?;

        let transaction = Transaction::card(user_id, amount, currency, created.intent_id.clone());
        bounded(
            "create_transaction",
            timeout,
            self.transactions.create(&transaction),
        )
        .await?;

        tracing::info!(intent_id = %created.intent_id, %amount, "payment intent opened");

        Ok(OpenedIntent {
            intent_id: created.intent_id,
            client_secret: created.client_secret,
            amount,
            currency,
        })
    }

    /// Handles `orders.created`.
    #[tracing::instrument(
        skip(self, data),
        fields(order_id = %data.order_id, payment_method = %data.payment_method)
    )]
    pub async fn handle_order_created(&self, data: &OrderData) -> Result<PaymentOutcome> {
        let outcome = match data.payment_method {
            // Collected on delivery: nothing to authorize now.
            PaymentMethod::OnDelivery => PaymentOutcome::Succeeded,
            PaymentMethod::Card => self.validate_card_payment(data).await?,
        };

        let envelope = match &outcome {
            PaymentOutcome::Succeeded => data.to_envelope(Topic::PaymentSucceeded)?,
            PaymentOutcome::Failed(failure) => {
                tracing::warn!(reason = failure.code(), detail = %failure, "payment failed");
                data.to_failure_envelope(Topic::PaymentFailed, failure.code(), failure.to_string())?
            }
        };
        self.publish(envelope).await?;

        let label = match &outcome {
            PaymentOutcome::Succeeded => "succeeded",
            PaymentOutcome::Failed(_) => "failed",
        };
        metrics::counter!("saga_payment_outcomes_total", "outcome" => label).increment(1);

        Ok(outcome)
    }

    async fn validate_card_payment(&self, data: &OrderData) -> Result<PaymentOutcome> {
        let timeout = self.config.call_timeout;

        let Some(intent_id) = data.payment_intent_id.as_deref() else {
            return Ok(PaymentOutcome::Failed(PaymentFailure::MissingPaymentIntent));
        };

        let Some(intent) =
            bounded("get_intent", timeout, self.gateway.get_intent(intent_id)).await?
        else {
            return Ok(PaymentOutcome::Failed(PaymentFailure::UnknownPaymentIntent(
                intent_id.to_string(),
            )));
        };

        if intent.amount != data.amount {
            return Ok(PaymentOutcome::Failed(PaymentFailure::AmountMismatch {
                expected: data.amount,
                actual: intent.amount,
            }));
        }

        let Some(transaction) = bounded(
            "find_transaction",
            timeout,
            self.transactions.find_by_gateway_ref(intent_id),
        )
        .await?
        else {
            return Ok(PaymentOutcome::Failed(PaymentFailure::UnknownPaymentIntent(
                intent_id.to_string(),
            )));
        };

        match bounded(
            "link_order",
            timeout,
            self.transactions.link_order(intent_id, data.order_id),
        )
        .await?
        {
            LinkOutcome::Linked | LinkOutcome::AlreadyLinked => {}
            LinkOutcome::LinkedToOther(order_id) => {
                return Ok(PaymentOutcome::Failed(PaymentFailure::IntentAlreadyUsed {
                    order_id,
                }));
            }
        }

        // A redelivery keeps the status decided the first time.
        let status = if transaction.status == TransactionStatus::Pending {
            let status = TransactionStatus::from_gateway(&intent.status);
            bounded(
                "set_transaction_status",
                timeout,
                self.transactions.set_status(intent_id, status),
            )
            .await?;
            status
        } else {
            transaction.status
        };

        Ok(match status {
            TransactionStatus::Completed => PaymentOutcome::Succeeded,
            status => PaymentOutcome::Failed(PaymentFailure::Declined { status }),
        })
    }

    /// Handles `stock.reservation.failed` by refunding a completed card payment.
    #[tracing::instrument(skip(self, data), fields(order_id = %data.order_id))]
    pub async fn handle_stock_reservation_failed(&self, data: &OrderData) -> Result<RefundOutcome> {
        let timeout = self.config.call_timeout;

        let intent_id = match (data.payment_method, data.payment_intent_id.as_deref()) {
            (PaymentMethod::Card, Some(intent_id)) => intent_id,
            _ => return Ok(RefundOutcome::NotRequired),
        };

        let Some(transaction) = bounded(
            "find_transaction",
            timeout,
            self.transactions.find_by_gateway_ref(intent_id),
        )
        .await?
        else {
            return Ok(RefundOutcome::NotRequired);
        };

        if transaction.status != TransactionStatus::Completed
            || transaction.order_id != Some(data.order_id)
        {
            tracing::debug!(status = %transaction.status, "no refund required");
            return Ok(RefundOutcome::NotRequired);
        }

        // Keyed by order so a retry after a failed status write replays the refund.
        let idempotency_key = format!("refund-order-{}", data.order_id);
        let refund = bounded(
            "refund",
            timeout,
            self.gateway.refund(intent_id, &idempotency_key),
        )
        .await?;
        bounded(
            "set_transaction_status",
            timeout,
            self.transactions
                .set_status(intent_id, TransactionStatus::Refunded),
        )
        .await?;

        tracing::info!(refund_id = %refund.refund_id, "payment refunded");
        metrics::counter!("saga_payment_outcomes_total", "outcome" => "refunded").increment(1);

        Ok(RefundOutcome::Refunded {
            refund_id: refund.refund_id,
        })
    }

    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        bounded("publish", self.config.call_timeout, self.bus.publish(envelope)).await
    }
}

#[async_trait]
impl EventHandler for PaymentStep {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<()> {
        let data = OrderData::decode(envelope)?;
        match envelope.topic()? {
            Topic::OrdersCreated => self.handle_order_created(&data).await.map(drop),
            Topic::StockReservationFailed => {
                self.handle_stock_reservation_failed(&data).await.map(drop)
            }
            other => Err(SagaError::UnhandledTopic(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        CartItem, InMemoryCartService, InMemoryPaymentGateway, PaymentIntent, UserProfile,
    };
    use domain::{InMemoryTransactionStore, Order, OrderItem};
    use event_bus::InMemoryEventBus;

    const USER: UserId = UserId::new(7);

    struct Fixture {
        step: PaymentStep,
        gateway: InMemoryPaymentGateway,
        transactions: InMemoryTransactionStore,
        cart: InMemoryCartService,
        bus: InMemoryEventBus,
    }

    fn fixture() -> Fixture {
        let gateway = InMemoryPaymentGateway::new();
        let transactions = InMemoryTransactionStore::new();
        let cart = InMemoryCartService::new();
        let bus = InMemoryEventBus::new();
        let step = PaymentStep::new(
            Arc::new(gateway.clone()),
            Arc::new(transactions.clone()),
            Arc::new(cart.clone()),
            Arc::new(bus.clone()),
            SagaConfig::default(),
        );
        Fixture {
            step,
            gateway,
            transactions,
            cart,
            bus,
        }
    }

    fn order_data(
        order_id: i64,
        method: PaymentMethod,
        intent: Option<&str>,
        items: Vec<OrderItem>,
    ) -> OrderData {
        let order = Order::new(
            OrderId::new(order_id),
            USER,
            items,
            "1 Main St",
            method,
            intent.map(str::to_string),
        )
        .unwrap();
        OrderData::new(
            &order,
            UserProfile::new("Ada", "Lovelace", "ada@example.com"),
            chrono::Duration::hours(72),
        )
    }

    fn scenario_items() -> Vec<OrderItem> {
        vec![
            OrderItem::new("A", "Widget A", 2, Money::from_cents(1999)),
            OrderItem::new("B", "Widget B", 1, Money::from_cents(1000)),
        ]
    }

    async fn open_intent_for(f: &Fixture, items: &[OrderItem]) -> String {
        for item in items {
            f.cart
                .add_item(
                    USER,
                    CartItem::new(
                        item.sku.clone(),
                        item.name.clone(),
                        item.quantity,
                        item.unit_price,
                    ),
                )
                .await;
        }
        f.step.open_intent(USER).await.unwrap().intent_id
    }

    #[tokio::test]
    async fn open_intent_records_pending_transaction() {
        let f = fixture();
        let intent_id = open_intent_for(&f, &scenario_items()).await;

        let tx = f
            .transactions
            .find_by_gateway_ref(&intent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.amount.cents(), 4998);
        assert_eq!(tx.payment_method, PaymentMethod::Card);
    }

    #[tokio::test]
    async fn open_intent_requires_items() {
        let f = fixture();
        let err = f.step.open_intent(USER).await.unwrap_err();
        assert!(matches!(err, SagaError::EmptyCart(_)));
    }

    #[tokio::test]
    async fn matching_succeeded_intent_completes_payment() {
        let f = fixture();
        let intent_id = open_intent_for(&f, &scenario_items()).await;
        let data = order_data(1, PaymentMethod::Card, Some(&intent_id), scenario_items());

        let outcome = f.step.handle_order_created(&data).await.unwrap();

        assert_eq!(outcome, PaymentOutcome::Succeeded);
        let tx = f
            .transactions
            .find_by_gateway_ref(&intent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.order_id, Some(OrderId::new(1)));
        assert_eq!(f.bus.published(Topic::PaymentSucceeded).len(), 1);
    }

    #[tokio::test]
    async fn on_delivery_succeeds_without_gateway_call() {
        let f = fixture();
        let data = order_data(1, PaymentMethod::OnDelivery, None, scenario_items());

        let outcome = f.step.handle_order_created(&data).await.unwrap();

        assert_eq!(outcome, PaymentOutcome::Succeeded);
        assert_eq!(f.gateway.intent_lookups().await, 0);
        let published = f.bus.published(Topic::PaymentSucceeded);
        assert_eq!(OrderData::decode(&published[0]).unwrap(), data);
    }

    #[tokio::test]
    async fn amount_mismatch_fails_payment() {
        let f = fixture();
        f.gateway
            .insert_intent(PaymentIntent {
                id: "pi_tampered".to_string(),
                status: "succeeded".to_string(),
                amount: Money::from_cents(2500),
                currency: Currency::Usd,
            })
            .await;
        let data = order_data(
            1,
            PaymentMethod::Card,
            Some("pi_tampered"),
            vec![OrderItem::new("C", "Widget C", 1, Money::from_cents(3000))],
        );

        let outcome = f.step.handle_order_created(&data).await.unwrap();

        assert_eq!(
            outcome,
            PaymentOutcome::Failed(PaymentFailure::AmountMismatch {
                expected: Money::from_cents(3000),
                actual: Money::from_cents(2500),
            })
        );
        let failed = f.bus.published(Topic::PaymentFailed);
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].metadata_str(crate::events::FAILURE_REASON),
            Some("AMOUNT_MISMATCH")
        );
        assert!(f.bus.published(Topic::PaymentSucceeded).is_empty());
    }

    #[tokio::test]
    async fn declined_intent_fails_payment() {
        let f = fixture();
        f.gateway.set_initial_status("requires_payment_method").await;
        let intent_id = open_intent_for(&f, &scenario_items()).await;
        let data = order_data(1, PaymentMethod::Card, Some(&intent_id), scenario_items());

        let outcome = f.step.handle_order_created(&data).await.unwrap();

        assert_eq!(
            outcome,
            PaymentOutcome::Failed(PaymentFailure::Declined {
                status: TransactionStatus::Failed
            })
        );
        let tx = f
            .transactions
            .find_by_gateway_ref(&intent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn missing_or_unknown_intent_fails_payment() {
        let f = fixture();

        let data = order_data(1, PaymentMethod::Card, None, scenario_items());
        assert_eq!(
            f.step.handle_order_created(&data).await.unwrap(),
            PaymentOutcome::Failed(PaymentFailure::MissingPaymentIntent)
        );

        let data = order_data(2, PaymentMethod::Card, Some("pi_nope"), scenario_items());
        assert!(matches!(
            f.step.handle_order_created(&data).await.unwrap(),
            PaymentOutcome::Failed(PaymentFailure::UnknownPaymentIntent(_))
        ));
        assert_eq!(f.bus.published(Topic::PaymentFailed).len(), 2);
    }

    #[tokio::test]
    async fn intent_cannot_pay_two_orders() {
        let f = fixture();
        let intent_id = open_intent_for(&f, &scenario_items()).await;

        let first = order_data(1, PaymentMethod::Card, Some(&intent_id), scenario_items());
        let second = order_data(2, PaymentMethod::Card, Some(&intent_id), scenario_items());
        f.step.handle_order_created(&first).await.unwrap();

        let outcome = f.step.handle_order_created(&second).await.unwrap();
        assert_eq!(
            outcome,
            PaymentOutcome::Failed(PaymentFailure::IntentAlreadyUsed {
                order_id: OrderId::new(1)
            })
        );
    }

    #[tokio::test]
    async fn replayed_order_created_is_idempotent() {
        let f = fixture();
        let intent_id = open_intent_for(&f, &scenario_items()).await;
        let data = order_data(1, PaymentMethod::Card, Some(&intent_id), scenario_items());

        let first = f.step.handle_order_created(&data).await.unwrap();
        // The gateway state moving on must not change the recorded outcome.
        f.gateway.set_intent_status(&intent_id, "canceled").await;
        let second = f.step.handle_order_created(&data).await.unwrap();

        assert_eq!(first, second);
        let published = f.bus.published(Topic::PaymentSucceeded);
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].event_id, published[1].event_id);
        assert_eq!(published[0].payload, published[1].payload);
        let tx = f
            .transactions
            .find_by_gateway_ref(&intent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn gateway_outage_is_transient() {
        let f = fixture();
        let intent_id = open_intent_for(&f, &scenario_items()).await;
        f.gateway.set_fail_on_get(true).await;
        let data = order_data(1, PaymentMethod::Card, Some(&intent_id), scenario_items());

        let err = f.step.handle_order_created(&data).await.unwrap_err();
        assert!(err.is_transient());
        assert!(f.bus.published(Topic::PaymentSucceeded).is_empty());
        assert!(f.bus.published(Topic::PaymentFailed).is_empty());
    }

    #[tokio::test]
    async fn stock_failure_refunds_completed_card_payment() {
        let f = fixture();
        let intent_id = open_intent_for(&f, &scenario_items()).await;
        let data = order_data(1, PaymentMethod::Card, Some(&intent_id), scenario_items());
        f.step.handle_order_created(&data).await.unwrap();

        let outcome = f.step.handle_stock_reservation_failed(&data).await.unwrap();
        assert!(matches!(outcome, RefundOutcome::Refunded { .. }));

        let again = f.step.handle_stock_reservation_failed(&data).await.unwrap();
        assert_eq!(again, RefundOutcome::NotRequired);

        assert_eq!(f.gateway.refunds().await, vec![intent_id.clone()]);
        let tx = f
            .transactions
            .find_by_gateway_ref(&intent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Refunded);
    }

    #[tokio::test]
    async fn refund_retry_after_failed_status_write_refunds_once() {
        let f = fixture();
        let intent_id = open_intent_for(&f, &scenario_items()).await;
        let data = order_data(1, PaymentMethod::Card, Some(&intent_id), scenario_items());
        f.step.handle_order_created(&data).await.unwrap();

        f.transactions.set_fail_writes(true).await;
        let err = f.step.handle_stock_reservation_failed(&data).await.unwrap_err();
        assert!(err.is_transient());
        f.transactions.set_fail_writes(false).await;

        let outcome = f.step.handle_stock_reservation_failed(&data).await.unwrap();
        assert_eq!(
            outcome,
            RefundOutcome::Refunded {
                refund_id: "re_000001".to_string()
            }
        );
        assert_eq!(f.gateway.refunds().await, vec![intent_id.clone()]);
        let tx = f
            .transactions
            .find_by_gateway_ref(&intent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Refunded);
    }

    #[tokio::test]
    async fn stock_failure_without_charge_needs_no_refund() {
        let f = fixture();
        let data = order_data(1, PaymentMethod::OnDelivery, None, scenario_items());
        assert_eq!(
            f.step.handle_stock_reservation_failed(&data).await.unwrap(),
            RefundOutcome::NotRequired
        );

        let intent_id = open_intent_for(&f, &scenario_items()).await;
        let pending = order_data(2, PaymentMethod::Card, Some(&intent_id), scenario_items());
        assert_eq!(
            f.step
                .handle_stock_reservation_failed(&pending)
                .await
                .unwrap(),
            RefundOutcome::NotRequired
        );
        assert!(f.gateway.refunds().await.is_empty());
    }

    #[tokio::test]
    async fn handler_rejects_foreign_topic() {
        let f = fixture();
        let data = order_data(1, PaymentMethod::OnDelivery, None, scenario_items());
        let envelope = data.to_envelope(Topic::StockReserved).unwrap();

        let err = f.step.handle(&envelope).await.unwrap_err();
        assert!(matches!(err, SagaError::UnhandledTopic(_)));
    }
}
