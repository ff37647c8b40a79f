use async_trait::async_trait;
use common::OrderId;

use super::{LinkOutcome, Transaction, TransactionStatus};
use crate::Result;

/// Storage owned by the payment service, keyed by gateway reference.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persists a new transaction.
    async fn create(&self, transaction: &Transaction) -> Result<()>;

    /// Loads the transaction of a payment intent.
    async fn find_by_gateway_ref(&self, gateway_ref: &str) -> Result<Option<Transaction>>;

    /// Links the transaction of a payment intent to an order.
    async fn link_order(&self, gateway_ref: &str, order_id: OrderId) -> Result<LinkOutcome>;

    /// Sets the status of the transaction of a payment intent.
    ///
    /// Setting the current status again is a no-op and returns false.
    async fn set_status(&self, gateway_ref: &str, status: TransactionStatus) -> Result<bool>;
}
