//! Orders and the order store.

mod memory;
mod model;
mod postgres;
mod state;
mod store;

pub use memory::InMemoryOrderStore;
pub use model::{Order, OrderItem, OutboxMessage};
pub use postgres::PostgresOrderStore;
pub use state::OrderStatus;
pub use store::OrderStore;

use common::OrderId;
use thiserror::Error;

/// Errors that can occur during order operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// No order exists with this id.
    #[error("Order not found: {0}")]
    NotFound(OrderId),

    /// An order with this id was already stored.
    #[error("Order already exists: {0}")]
    Duplicate(OrderId),

    /// Order has no items.
    #[error("Order has no items")]
    NoItems,

    /// Invalid quantity.
    #[error("Invalid quantity for {sku}: {quantity} (must be greater than 0)")]
    InvalidQuantity { sku: crate::Sku, quantity: u32 },

    /// The requested status change is not allowed by the lifecycle.
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
}
