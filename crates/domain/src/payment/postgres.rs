use async_trait::async_trait;
use common::{OrderId, UserId};
use sqlx::{PgPool, Row, postgres::PgRow};

use super::{LinkOutcome, Transaction, TransactionError, TransactionStatus, TransactionStore};
use crate::{DomainError, Money, Result};

/// PostgreSQL-backed transaction store.
#[derive(Clone)]
pub struct PostgresTransactionStore {
    pool: PgPool,
}

impl PostgresTransactionStore {
    /// Creates a new PostgreSQL transaction store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_transaction(row: PgRow) -> Result<Transaction> {
        let status: String = row.try_get("status")?;
        let currency: String = row.try_get("currency")?;
        let payment_method: String = row.try_get("payment_method")?;

        Ok(Transaction {
            id: row.try_get("id")?,
            order_id: row.try_get::<Option<i64>, _>("order_id")?.map(OrderId::new),
            user_id: UserId::new(row.try_get("user_id")?),
            amount: Money::from_cents(row.try_get("amount_cents")?),
            currency: currency.parse().map_err(DomainError::InvalidData)?,
            status: status.parse().map_err(DomainError::InvalidData)?,
            gateway_ref: row.try_get("gateway_ref")?,
            payment_method: payment_method.parse().map_err(DomainError::InvalidData)?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl TransactionStore for PostgresTransactionStore {
    async fn create(&self, transaction: &Transaction) -> Result<()> {
        let gateway_ref = transaction
            .gateway_ref
            .as_deref()
            .ok_or(TransactionError::MissingGatewayReference(transaction.id))?;

        sqlx::query(
            r#"
            INSERT INTO transactions (id, order_id, user_id, amount_cents, currency, status,
                                      gateway_ref, payment_method, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.order_id.map(|id| id.as_i64()))
        .bind(transaction.user_id.as_i64())
        .bind(transaction.amount.cents())
        .bind(transaction.currency.as_str())
        .bind(transaction.status.as_str())
        .bind(gateway_ref)
        .bind(transaction.payment_method.as_str())
        .bind(transaction.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return DomainError::Transaction(TransactionError::Duplicate(
                    gateway_ref.to_string(),
                ));
            }
            DomainError::Database(e)
        })?;

        Ok(())
    }

    async fn find_by_gateway_ref(&self, gateway_ref: &str) -> Result<Option<Transaction>> {
        sqlx::query(
            r#"
            SELECT id, order_id, user_id, amount_cents, currency, status,
                   gateway_ref, payment_method, created_at
            FROM transactions
            WHERE gateway_ref = $1
            "#,
        )
        .bind(gateway_ref)
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_transaction)
        .transpose()
    }

    async fn link_order(&self, gateway_ref: &str, order_id: OrderId) -> Result<LinkOutcome> {
        let updated = sqlx::query(
            "UPDATE transactions SET order_id = $2 WHERE gateway_ref = $1 AND order_id IS NULL",
        )
        .bind(gateway_ref)
        .bind(order_id.as_i64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(LinkOutcome::Linked);
        }

        let linked: Option<Option<i64>> =
            sqlx::query_scalar("SELECT order_id FROM transactions WHERE gateway_ref = $1")
                .bind(gateway_ref)
                .fetch_optional(&self.pool)
                .await?;

        match linked {
            None => Err(TransactionError::NotFound(gateway_ref.to_string()).into()),
            Some(Some(id)) if id == order_id.as_i64() => Ok(LinkOutcome::AlreadyLinked),
            Some(Some(other)) => Ok(LinkOutcome::LinkedToOther(OrderId::new(other))),
            // Unlinked again between the two statements; links are never removed.
            Some(None) => Err(DomainError::InvalidData(format!(
                "transaction {gateway_ref} lost its order link"
            ))),
        }
    }

    async fn set_status(&self, gateway_ref: &str, status: TransactionStatus) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT status FROM transactions WHERE gateway_ref = $1 FOR UPDATE",
        )
        .bind(gateway_ref)
        .fetch_optional(&mut *tx)
        .await?;

        let current: TransactionStatus = current
            .ok_or_else(|| TransactionError::NotFound(gateway_ref.to_string()))?
            .parse()
            .map_err(DomainError::InvalidData)?;

        if current == status {
            return Ok(false);
        }
        if !current.can_transition_to(status) {
            return Err(TransactionError::InvalidTransition {
                from: current,
                to: status,
            }
            .into());
        }

        sqlx::query("UPDATE transactions SET status = $2 WHERE gateway_ref = $1")
            .bind(gateway_ref)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}
