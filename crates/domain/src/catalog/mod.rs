//! Catalog stock ledger with per-order reservation records.

mod ledger;
mod memory;

pub use ledger::{
    ReleaseOutcome, Reservation, ReserveOutcome, StockLedger, StockLine, StockRecord,
    StockShortage, merge_lines,
};
pub use memory::InMemoryStockLedger;

use common::OrderId;
use thiserror::Error;

use crate::Sku;

/// Errors that can occur during stock operations.
#[derive(Debug, Error)]
pub enum StockError {
    /// A reservation was requested without lines.
    #[error("Reservation for order {0} has no lines")]
    NoLines(OrderId),

    /// A line requested no stock.
    #[error("Invalid quantity for {sku}: {quantity} (must be greater than 0)")]
    InvalidQuantity { sku: Sku, quantity: u32 },
}
