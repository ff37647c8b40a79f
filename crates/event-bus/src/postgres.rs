use async_trait::async_trait;
use sqlx::PgPool;

use crate::{EventId, Inbox, Result};

/// PostgreSQL-backed inbox over the `processed_events` table.
#[derive(Clone)]
pub struct PostgresInbox {
    pool: PgPool,
}

impl PostgresInbox {
    /// Creates a new PostgreSQL inbox.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Inbox for PostgresInbox {
    async fn is_processed(&self, group: &str, event_id: EventId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_events
                WHERE consumer_group = $1 AND event_id = $2
            )
            "#,
        )
        .bind(group)
        .bind(event_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn mark_processed(&self, group: &str, event_id: EventId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (consumer_group, event_id)
            VALUES ($1, $2)
            ON CONFLICT (consumer_group, event_id) DO NOTHING
            "#,
        )
        .bind(group)
        .bind(event_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
