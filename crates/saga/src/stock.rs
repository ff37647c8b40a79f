//! Stock Saga Step.
//!
//! Reserves stock for paid orders and releases it for failed payments. Every
//! stock mutation is mirrored to the search index on a detached task.

use std::sync::Arc;

use async_trait::async_trait;
use domain::{ReleaseOutcome, ReserveOutcome, StockLedger, StockRecord, StockShortage};
use event_bus::{EventBus, EventEnvelope, Topic};

use crate::config::SagaConfig;
use crate::consumer::EventHandler;
use crate::error::{Result, SagaError, bounded};
use crate::events::OrderData;
use crate::services::SearchIndex;

/// Why stock could not be reserved for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockFailure {
    pub shortage: StockShortage,
}

impl StockFailure {
    /// Returns the `failure_reason` code published with `stock.reservation.failed`.
    pub fn code(&self) -> &'static str {
        match self.shortage {
            StockShortage::UnknownSku { .. } => "UNKNOWN_SKU",
            StockShortage::Insufficient { .. } => "INSUFFICIENT_STOCK",
            StockShortage::OrderReleased => "ORDER_RELEASED",
        }
    }
}

impl std::fmt::Display for StockFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.shortage, f)
    }
}

/// Result of reserving stock for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockOutcome {
    Reserved,
    Failed(StockFailure),
}

/// The catalog service's part of the checkout saga.
pub struct StockStep {
    ledger: Arc<dyn StockLedger>,
    search: Arc<dyn SearchIndex>,
    bus: Arc<dyn EventBus>,
    config: SagaConfig,
}

impl StockStep {
    pub fn new(
        ledger: Arc<dyn StockLedger>,
        search: Arc<dyn SearchIndex>,
        bus: Arc<dyn EventBus>,
        config: SagaConfig,
    ) -> Self {
        Self {
            ledger,
            search,
            bus,
            config,
        }
    }

    /// Handles `payment.succeeded`: reserves every line of the order or none.
    #[tracing::instrument(skip(self, data), fields(order_id = %data.order_id))]
    pub async fn handle_payment_succeeded(&self, data: &OrderData) -> Result<StockOutcome> {
        let lines = data.stock_lines();
        let reserved = bounded(
            "reserve_stock",
            self.config.call_timeout,
            self.ledger.reserve(data.order_id, &lines),
        )
        .await?;

        let (outcome, label) = match reserved {
            ReserveOutcome::Reserved(records) => {
                self.mirror(records);
                (StockOutcome::Reserved, "reserved")
            }
            // Republished so a reservation whose event was lost still moves on.
            ReserveOutcome::AlreadyReserved => (StockOutcome::Reserved, "already_reserved"),
            ReserveOutcome::Rejected(shortage) => {
                (StockOutcome::Failed(StockFailure { shortage }), "rejected")
            }
        };

        let envelope = match &outcome {
            StockOutcome::Reserved => data.to_envelope(Topic::StockReserved)?,
            StockOutcome::Failed(failure) => {
                tracing::warn!(
                    reason = failure.code(),
                    detail = %failure,
                    "stock reservation failed"
                );
                data.to_failure_envelope(
                    Topic::StockReservationFailed,
                    failure.code(),
                    failure.to_string(),
                )?
            }
        };
        bounded("publish", self.config.call_timeout, self.bus.publish(envelope)).await?;

        metrics::counter!("saga_stock_outcomes_total", "outcome" => label).increment(1);
        Ok(outcome)
    }

    /// Handles `payment.failed`: credits back whatever was reserved for the order.
    #[tracing::instrument(skip(self, data), fields(order_id = %data.order_id))]
    pub async fn handle_payment_failed(&self, data: &OrderData) -> Result<ReleaseOutcome> {
        let released = bounded(
            "release_stock",
            self.config.call_timeout,
            self.ledger.release(data.order_id),
        )
        .await?;

        let label = match &released {
            ReleaseOutcome::Released(records) => {
                tracing::info!(skus = records.len(), "reserved stock released");
                self.mirror(records.clone());
                "released"
            }
            ReleaseOutcome::AlreadyReleased => "already_released",
            ReleaseOutcome::NothingReserved => "nothing_reserved",
        };
        metrics::counter!("saga_stock_outcomes_total", "outcome" => label).increment(1);

        Ok(released)
    }

    fn mirror(&self, records: Vec<StockRecord>) {
        if records.is_empty() {
            return;
        }
        let search = self.search.clone();
        let timeout = self.config.call_timeout;
        tokio::spawn(async move {
            if let Err(e) = bounded("index_stock", timeout, search.index_stock(&records)).await {
                metrics::counter!("saga_search_index_failures_total").increment(1);
                tracing::warn!(error = %e, skus = records.len(), "search index update failed");
            }
        });
    }
}

#[async_trait]
impl EventHandler for StockStep {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<()> {
        let data = OrderData::decode(envelope)?;
        match envelope.topic()? {
            Topic::PaymentSucceeded => self.handle_payment_succeeded(&data).await.map(drop),
            Topic::PaymentFailed => self.handle_payment_failed(&data).await.map(drop),
            other => Err(SagaError::UnhandledTopic(other.to_string())),
        }
    }
}
