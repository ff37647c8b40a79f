//! Card payment gateway collaborator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{Currency, Money};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::SagaError;

/// A payment intent freshly opened at the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedIntent {
    pub intent_id: String,
    pub client_secret: String,
}

/// A payment intent as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    /// Gateway state, e.g. `succeeded` or `requires_payment_method`.
    pub status: String,
    /// Authorized amount in minor units.
    pub amount: Money,
    pub currency: Currency,
}

/// A refund issued by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub refund_id: String,
    pub status: String,
}

/// Trait for the external card payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a payment intent for an amount.
    async fn create_intent(
        &self,
        amount: Money,
        currency: Currency,
    ) -> Result<CreatedIntent, SagaError>;

    /// Looks up a payment intent. Returns None when the gateway does not know it.
    async fn get_intent(&self, intent_id: &str) -> Result<Option<PaymentIntent>, SagaError>;

    /// Refunds the charge of a payment intent.
    ///
    /// Repeating a call with the same `idempotency_key` returns the refund
    /// issued by the first call instead of refunding again.
    async fn refund(&self, intent_id: &str, idempotency_key: &str) -> Result<Refund, SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryGatewayState {
    intents: HashMap<String, PaymentIntent>,
    refunds: Vec<String>,
    refunds_by_key: HashMap<String, Refund>,
    next_id: u32,
    intent_lookups: usize,
    initial_status: Option<String>,
    fail_on_get: bool,
    fail_on_refund: bool,
}

/// In-memory payment gateway for testing.
///
/// Opened intents report `succeeded` unless configured otherwise.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<RwLock<InMemoryGatewayState>>,
}

impl InMemoryPaymentGateway {
    /// Creates a new in-memory gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an intent as if a client had authorized it.
    pub async fn insert_intent(&self, intent: PaymentIntent) {
        self.state
            .write()
            .await
            .intents
            .insert(intent.id.clone(), intent);
    }

    /// Sets the status newly opened intents report.
    pub async fn set_initial_status(&self, status: impl Into<String>) {
        self.state.write().await.initial_status = Some(status.into());
    }

    /// Overrides the status of an intent.
    pub async fn set_intent_status(&self, intent_id: &str, status: impl Into<String>) {
        if let Some(intent) = self.state.write().await.intents.get_mut(intent_id) {
            intent.status = status.into();
        }
    }

    /// Configures lookups to fail.
    pub async fn set_fail_on_get(&self, fail: bool) {
        self.state.write().await.fail_on_get = fail;
    }

    /// Configures refunds to fail.
    pub async fn set_fail_on_refund(&self, fail: bool) {
        self.state.write().await.fail_on_refund = fail;
    }

    /// Returns the intents refunded so far.
    pub async fn refunds(&self) -> Vec<String> {
        self.state.read().await.refunds.clone()
    }

    /// Returns how many intent lookups were made.
    pub async fn intent_lookups(&self) -> usize {
        self.state.read().await.intent_lookups
    }

    /// Returns an intent as the gateway currently reports it.
    pub async fn intent(&self, intent_id: &str) -> Option<PaymentIntent> {
        self.state.read().await.intents.get(intent_id).cloned()
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn create_intent(
        &self,
        amount: Money,
        currency: Currency,
    ) -> Result<CreatedIntent, SagaError> {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let intent_id = format!("pi_{:06}", state.next_id);
        let status = state
            .initial_status
            .clone()
            .unwrap_or_else(|| "succeeded".to_string());

        state.intents.insert(
            intent_id.clone(),
            PaymentIntent {
                id: intent_id.clone(),
                status,
                amount,
                currency,
            },
        );

        Ok(CreatedIntent {
            client_secret: format!("{intent_id}_secret"),
            intent_id,
        })
    }

    async fn get_intent(&self, intent_id: &str) -> Result<Option<PaymentIntent>, SagaError> {
        let mut state = self.state.write().await;
        state.intent_lookups += 1;
        if state.fail_on_get {
            return Err(SagaError::collaborator("gateway", "gateway unavailable"));
        }
        Ok(state.intents.get(intent_id).cloned())
    }

    async fn refund(&self, intent_id: &str, idempotency_key: &str) -> Result<Refund, SagaError> {
        let mut state = self.state.write().await;
        if state.fail_on_refund {
            return Err(SagaError::collaborator("gateway", "refund rejected"));
        }
        if let Some(refund) = state.refunds_by_key.get(idempotency_key) {
            return Ok(refund.clone());
        }
        if !state.intents.contains_key(intent_id) {
            return Err(SagaError::collaborator(
                "gateway",
                format!("no such payment intent: {intent_id}"),
            ));
        }
        if state.refunds.iter().any(|id| id == intent_id) {
            return Err(SagaError::collaborator(
                "gateway",
                format!("charge already refunded: {intent_id}"),
            ));
        }

        state.refunds.push(intent_id.to_string());
        let refund = Refund {
            refund_id: format!("re_{:06}", state.refunds.len()),
            status: "succeeded".to_string(),
        };
        state
            .refunds_by_key
            .insert(idempotency_key.to_string(), refund.clone());
        Ok(refund)
    }
}
