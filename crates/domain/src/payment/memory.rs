use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::OrderId;
use tokio::sync::RwLock;

use super::{LinkOutcome, Transaction, TransactionError, TransactionStatus, TransactionStore};
use crate::{DomainError, Result};

#[derive(Default)]
struct State {
    by_ref: HashMap<String, Transaction>,
    fail_writes: bool,
}

/// In-memory transaction store for testing and development.
#[derive(Clone, Default)]
pub struct InMemoryTransactionStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures writes to fail with a transient error.
    pub async fn set_fail_writes(&self, fail: bool) {
        self.state.write().await.fail_writes = fail;
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn create(&self, transaction: &Transaction) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_writes {
            return Err(DomainError::Unavailable("transaction store".to_string()));
        }

        let gateway_ref = transaction
            .gateway_ref
            .clone()
            .ok_or(TransactionError::MissingGatewayReference(transaction.id))?;

        if state.by_ref.contains_key(&gateway_ref) {
            return Err(TransactionError::Duplicate(gateway_ref).into());
        }
        state.by_ref.insert(gateway_ref, transaction.clone());
        Ok(())
    }

    async fn find_by_gateway_ref(&self, gateway_ref: &str) -> Result<Option<Transaction>> {
        Ok(self.state.read().await.by_ref.get(gateway_ref).cloned())
    }

    async fn link_order(&self, gateway_ref: &str, order_id: OrderId) -> Result<LinkOutcome> {
        let mut state = self.state.write().await;
        if state.fail_writes {
            return Err(DomainError::Unavailable("transaction store".to_string()));
        }

        let transaction = state
            .by_ref
            .get_mut(gateway_ref)
            .ok_or_else(|| TransactionError::NotFound(gateway_ref.to_string()))?;

        Ok(match transaction.order_id {
            None => {
                transaction.order_id = Some(order_id);
                LinkOutcome::Linked
            }
            Some(linked) if linked == order_id => LinkOutcome::AlreadyLinked,
            Some(other) => LinkOutcome::LinkedToOther(other),
        })
    }

    async fn set_status(&self, gateway_ref: &str, status: TransactionStatus) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.fail_writes {
            return Err(DomainError::Unavailable("transaction store".to_string()));
        }

        let transaction = state
            .by_ref
            .get_mut(gateway_ref)
            .ok_or_else(|| TransactionError::NotFound(gateway_ref.to_string()))?;

        if transaction.status == status {
            return Ok(false);
        }
        if !transaction.status.can_transition_to(status) {
            return Err(TransactionError::InvalidTransition {
                from: transaction.status,
                to: status,
            }
            .into());
        }
        transaction.status = status;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Currency, Money};
    use common::UserId;

    async fn store_with_intent(gateway_ref: &str) -> InMemoryTransactionStore {
        let store = InMemoryTransactionStore::new();
        let tx = Transaction::card(
            UserId::new(1),
            Money::from_cents(4998),
            Currency::Usd,
            gateway_ref,
        );
        store.create(&tx).await.unwrap();
        store
    }

    #[tokio::test]
    async fn set_status_is_idempotent() {
        let store = store_with_intent("pi_1").await;

        assert!(store.set_status("pi_1", TransactionStatus::Completed).await.unwrap());
        assert!(!store.set_status("pi_1", TransactionStatus::Completed).await.unwrap());

        let tx = store.find_by_gateway_ref("pi_1").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn set_status_rejects_invalid_transition() {
        let store = store_with_intent("pi_1").await;
        store.set_status("pi_1", TransactionStatus::Failed).await.unwrap();

        let err = store
            .set_status("pi_1", TransactionStatus::Refunded)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::Transaction(TransactionError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn link_order_is_idempotent_per_order() {
        let store = store_with_intent("pi_1").await;

        let first = store.link_order("pi_1", OrderId::new(1)).await.unwrap();
        let again = store.link_order("pi_1", OrderId::new(1)).await.unwrap();
        let other = store.link_order("pi_1", OrderId::new(2)).await.unwrap();

        assert_eq!(first, LinkOutcome::Linked);
        assert_eq!(again, LinkOutcome::AlreadyLinked);
        assert_eq!(other, LinkOutcome::LinkedToOther(OrderId::new(1)));
    }

    #[tokio::test]
    async fn unknown_intent_is_not_found() {
        let store = InMemoryTransactionStore::new();
        let err = store
            .link_order("pi_missing", OrderId::new(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::Transaction(TransactionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_intent_is_rejected() {
        let store = store_with_intent("pi_1").await;
        let tx = Transaction::card(UserId::new(2), Money::from_cents(1), Currency::Usd, "pi_1");
        let err = store.create(&tx).await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::Transaction(TransactionError::Duplicate(_))
        ));
    }
}
