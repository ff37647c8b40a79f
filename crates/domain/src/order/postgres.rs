use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, UserId};
use event_bus::EventEnvelope;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use super::{Order, OrderError, OrderItem, OrderStatus, OrderStore, OutboxMessage};
use crate::{DomainError, Money, Result};

/// PostgreSQL-backed order store.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Creates a new PostgreSQL order store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_outbox(
        tx: &mut Transaction<'_, Postgres>,
        order_id: OrderId,
        envelope: &EventEnvelope,
    ) -> Result<()> {
        sqlx::query("INSERT INTO order_outbox (order_id, envelope) VALUES ($1, $2)")
            .bind(order_id.as_i64())
            .bind(serde_json::to_value(envelope)?)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    fn row_to_item(row: PgRow) -> Result<OrderItem> {
        let quantity: i32 = row.try_get("quantity")?;
        Ok(OrderItem {
            sku: row.try_get::<String, _>("sku")?.into(),
            name: row.try_get("name")?,
            quantity: u32::try_from(quantity)
                .map_err(|_| DomainError::InvalidData(format!("quantity {quantity}")))?,
            unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
        })
    }

    fn row_to_order(row: &PgRow, items: Vec<OrderItem>) -> Result<Order> {
        let status: String = row.try_get("status")?;
        let payment_method: String = row.try_get("payment_method")?;

        Ok(Order {
            id: OrderId::new(row.try_get("id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            status: status.parse().map_err(DomainError::InvalidData)?,
            items,
            total: Money::from_cents(row.try_get("total_cents")?),
            shipping_address: row.try_get("shipping_address")?,
            payment_method: payment_method.parse().map_err(DomainError::InvalidData)?,
            payment_intent_id: row.try_get("payment_intent_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn next_order_id(&self) -> Result<OrderId> {
        let id: i64 = sqlx::query_scalar("SELECT nextval(pg_get_serial_sequence('orders', 'id'))")
            .fetch_one(&self.pool)
            .await?;
        Ok(OrderId::new(id))
    }

    #[tracing::instrument(skip_all, fields(order_id = %order.id))]
    async fn insert_with_outbox(&self, order: &Order, outbox: EventEnvelope) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, status, total_cents, shipping_address,
                                payment_method, payment_intent_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(order.id.as_i64())
        .bind(order.user_id.as_i64())
        .bind(order.status.as_str())
        .bind(order.total.cents())
        .bind(&order.shipping_address)
        .bind(order.payment_method.as_str())
        .bind(&order.payment_intent_id)
        .bind(order.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return DomainError::Order(OrderError::Duplicate(order.id));
            }
            DomainError::Database(e)
        })?;

        for (position, item) in order.items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, position, sku, name, quantity, unit_price_cents)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(order.id.as_i64())
            .bind(position as i32)
            .bind(item.sku.as_str())
            .bind(&item.name)
            .bind(item.quantity as i32)
            .bind(item.unit_price.cents())
            .execute(&mut *tx)
            .await?;
        }

        Self::insert_outbox(&mut tx, order.id, &outbox).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, status, total_cents, shipping_address,
                   payment_method, payment_intent_id, created_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let items = sqlx::query(
            r#"
            SELECT sku, name, quantity, unit_price_cents
            FROM order_items
            WHERE order_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id.as_i64())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Self::row_to_item)
        .collect::<Result<Vec<_>>>()?;

        Self::row_to_order(&row, items).map(Some)
    }

    #[tracing::instrument(skip(self, outbox))]
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

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE orders SET status = $1 WHERE id = $2 AND status = $3")
            .bind(next.as_str())
            .bind(id.as_i64())
            .bind(expected.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if updated == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM orders WHERE id = $1)")
                    .bind(id.as_i64())
                    .fetch_one(&mut *tx)
                    .await?;
            if !exists {
                return Err(OrderError::NotFound(id).into());
            }
            return Ok(false);
        }

        if let Some(envelope) = outbox {
            Self::insert_outbox(&mut tx, id, &envelope).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, envelope, created_at
            FROM order_outbox
            WHERE published_at IS NULL
            ORDER BY id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<OutboxMessage> {
                let envelope: serde_json::Value = row.try_get("envelope")?;
                Ok(OutboxMessage {
                    id: row.try_get("id")?,
                    order_id: OrderId::new(row.try_get("order_id")?),
                    envelope: serde_json::from_value(envelope)?,
                    created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
                })
            })
            .collect()
    }

    async fn mark_outbox_published(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE order_outbox SET published_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn purge_published_outbox(&self, published_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM order_outbox WHERE published_at IS NOT NULL AND published_at < $1",
        )
        .bind(published_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
