//! Relay from the order outbox to the event bus.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use domain::OrderStore;
use event_bus::EventBus;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, bounded};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Publishes messages committed to the order outbox.
///
/// Messages are published in outbox order and marked published only after
/// the bus accepted them, so a crash in between republishes the message with
/// the same event id.
pub struct OutboxRelay {
    orders: Arc<dyn OrderStore>,
    bus: Arc<dyn EventBus>,
    call_timeout: Duration,
    batch_size: usize,
    retention: chrono::Duration,
    flushing: Mutex<()>,
}

impl OutboxRelay {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        bus: Arc<dyn EventBus>,
        call_timeout: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            orders,
            bus,
            call_timeout,
            batch_size,
            retention: chrono::Duration::hours(24),
            flushing: Mutex::new(()),
        }
    }

    /// Sets how long published messages are kept before [`Self::purge`] deletes them.
    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Publishes one batch of pending messages. Returns how many were published.
    ///
    /// Stops at the first message the bus rejects so later messages never
    /// overtake it.
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.flushing.lock().await;

        let pending = bounded(
            "pending_outbox",
            self.call_timeout,
            self.orders.pending_outbox(self.batch_size),
        )
        .await?;

        let mut published = 0;
        for message in pending {
            let event_type = message.envelope.event_type.clone();
            let event_id = message.envelope.event_id;

            if let Err(e) = bounded(
                "publish",
                self.call_timeout,
                self.bus.publish(message.envelope),
            )
            .await
            {
                metrics::counter!("saga_outbox_publish_failures_total").increment(1);
                return Err(e);
            }

            bounded(
                "mark_outbox_published",
                self.call_timeout,
                self.orders.mark_outbox_published(message.id),
            )
            .await?;

            tracing::debug!(
                outbox_id = message.id,
                order_id = %message.order_id,
                %event_id,
                %event_type,
                "outbox message published"
            );
            metrics::counter!("saga_outbox_published_total").increment(1);
            published += 1;
        }

        Ok(published)
    }

    /// Deletes published messages older than the retention. Returns how many.
    pub async fn purge(&self) -> Result<u64> {
        let published_before = Utc::now() - self.retention;
        let purged = bounded(
            "purge_published_outbox",
            self.call_timeout,
            self.orders.purge_published_outbox(published_before),
        )
        .await?;

        if purged > 0 {
            tracing::debug!(purged, "published outbox messages purged");
            metrics::counter!("saga_outbox_purged_total").increment(purged);
        }
        Ok(purged)
    }

    /// Polls the outbox until `token` is cancelled, purging published messages
    /// once a minute.
    pub async fn run(&self, poll_interval: Duration, token: CancellationToken) {
        tracing::info!(?poll_interval, "outbox relay started");

        let mut purge = tokio::time::interval(PURGE_INTERVAL);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {
                    if let Err(e) = self.flush().await {
                        tracing::warn!(error = %e, "outbox relay flush failed");
                    }
                }
                _ = purge.tick() => {
                    if let Err(e) = self.purge().await {
                        tracing::warn!(error = %e, "outbox purge failed");
                    }
                }
            }
        }

        tracing::info!("outbox relay stopped");
    }
}
