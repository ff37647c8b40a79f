use std::collections::BTreeMap;

use async_trait::async_trait;
use common::OrderId;
use serde::{Deserialize, Serialize};

use crate::{Result, Sku};

/// Stock of one SKU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    pub sku: Sku,
    pub quantity: u32,
    /// Whether the product can be sold, derived from the quantity.
    pub active: bool,
}

impl StockRecord {
    pub fn new(sku: impl Into<Sku>, quantity: u32) -> Self {
        Self {
            sku: sku.into(),
            quantity,
            active: quantity > 0,
        }
    }
}

/// Quantity of one SKU requested by an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLine {
    pub sku: Sku,
    pub quantity: u32,
}

impl StockLine {
    pub fn new(sku: impl Into<Sku>, quantity: u32) -> Self {
        Self {
            sku: sku.into(),
            quantity,
        }
    }
}

/// Merges lines for the same SKU, ordered by SKU.
pub fn merge_lines(lines: &[StockLine]) -> Vec<StockLine> {
    let mut merged: BTreeMap<&Sku, u32> = BTreeMap::new();
    for line in lines {
        *merged.entry(&line.sku).or_default() += line.quantity;
    }
    merged
        .into_iter()
        .map(|(sku, quantity)| StockLine::new(sku.clone(), quantity))
        .collect()
}

/// Why stock could not be reserved for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StockShortage {
    /// The catalog does not know the SKU.
    UnknownSku { sku: Sku },
    /// Less stock is available than requested.
    Insufficient {
        sku: Sku,
        requested: u32,
        available: u32,
    },
    /// The order was already compensated, so nothing may be reserved for it.
    OrderReleased,
}

impl std::fmt::Display for StockShortage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StockShortage::UnknownSku { sku } => write!(f, "unknown SKU {sku}"),
            StockShortage::Insufficient {
                sku,
                requested,
                available,
            } => write!(
                f,
                "insufficient stock for {sku}: requested {requested}, available {available}"
            ),
            StockShortage::OrderReleased => f.write_str("order already released"),
        }
    }
}

/// The per-order reservation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reservation {
    /// Stock was taken for these merged lines.
    Reserved(Vec<StockLine>),
    /// The reservation failed and no stock was taken.
    Rejected(StockShortage),
    /// The order was compensated. Stock taken for it, if any, was credited back.
    Released,
}

/// Outcome of [`StockLedger::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Stock was taken. Carries the updated records.
    Reserved(Vec<StockRecord>),
    /// Stock was taken by an earlier call for the same order.
    AlreadyReserved,
    /// Nothing was taken.
    Rejected(StockShortage),
}

/// Outcome of [`StockLedger::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Reserved stock was credited back. Carries the updated records.
    Released(Vec<StockRecord>),
    /// An earlier call already released the order.
    AlreadyReleased,
    /// No stock was ever taken for the order.
    NothingReserved,
}

/// Stock ledger owned by the catalog service.
#[async_trait]
pub trait StockLedger: Send + Sync {
    /// Loads the records of the given SKUs. Unknown SKUs are skipped.
    async fn load(&self, skus: &[Sku]) -> Result<Vec<StockRecord>>;

    /// Reserves every line of an order, or nothing.
    ///
    /// The outcome is recorded per order. Calling again for the same order
    /// returns the recorded outcome without touching stock.
    async fn reserve(&self, order_id: OrderId, lines: &[StockLine]) -> Result<ReserveOutcome>;

    /// Credits back stock reserved for an order.
    ///
    /// Only a `Reserved` record credits stock. An order without a record is
    /// marked released so a late reservation for it is refused.
    async fn release(&self, order_id: OrderId) -> Result<ReleaseOutcome>;

    /// Returns the reservation record of an order.
    async fn reservation(&self, order_id: OrderId) -> Result<Option<Reservation>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_flag_follows_quantity() {
        assert!(StockRecord::new("A", 1).active);
        assert!(!StockRecord::new("A", 0).active);
    }

    #[test]
    fn test_merge_lines_sums_per_sku() {
        let merged = merge_lines(&[
            StockLine::new("B", 1),
            StockLine::new("A", 2),
            StockLine::new("B", 3),
        ]);
        assert_eq!(merged, vec![StockLine::new("A", 2), StockLine::new("B", 4)]);
    }

    #[test]
    fn test_shortage_reason() {
        let shortage = StockShortage::Insufficient {
            sku: Sku::new("X1"),
            requested: 5,
            available: 2,
        };
        assert_eq!(
            shortage.to_string(),
            "insufficient stock for X1: requested 5, available 2"
        );
    }
}
