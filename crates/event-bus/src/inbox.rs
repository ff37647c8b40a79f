use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{EventId, Result};

/// Record of the event ids a consumer group has already handled.
///
/// Consumers check it before handling a delivery so that a redelivered
/// event is acknowledged without repeating its side effects.
#[async_trait]
pub trait Inbox: Send + Sync {
    /// Returns true when `group` has already handled `event_id`.
    async fn is_processed(&self, group: &str, event_id: EventId) -> Result<bool>;

    /// Records that `group` handled `event_id`. Recording twice is a no-op.
    async fn mark_processed(&self, group: &str, event_id: EventId) -> Result<()>;
}

/// In-memory inbox for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryInbox {
    processed: Arc<RwLock<HashSet<(String, EventId)>>>,
}

impl InMemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many (group, event) pairs were recorded.
    pub async fn len(&self) -> usize {
        self.processed.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.processed.read().await.is_empty()
    }
}

#[async_trait]
impl Inbox for InMemoryInbox {
    async fn is_processed(&self, group: &str, event_id: EventId) -> Result<bool> {
        Ok(self
            .processed
            .read()
            .await
            .contains(&(group.to_string(), event_id)))
    }

    async fn mark_processed(&self, group: &str, event_id: EventId) -> Result<()> {
        self.processed
            .write()
            .await
            .insert((group.to_string(), event_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Topic;

    #[tokio::test]
    async fn records_per_group() {
        let inbox = InMemoryInbox::new();
        let id = EventId::for_topic("1", Topic::OrdersCreated);

        assert!(!inbox.is_processed("payment", id).await.unwrap());
        inbox.mark_processed("payment", id).await.unwrap();
        inbox.mark_processed("payment", id).await.unwrap();

        assert!(inbox.is_processed("payment", id).await.unwrap());
        assert!(!inbox.is_processed("audit", id).await.unwrap());
        assert_eq!(inbox.len().await, 1);
    }
}
