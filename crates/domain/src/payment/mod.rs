//! Payment transactions and the transaction store.

mod memory;
mod model;
mod postgres;
mod store;

pub use memory::InMemoryTransactionStore;
pub use model::{LinkOutcome, Transaction, TransactionStatus};
pub use postgres::PostgresTransactionStore;
pub use store::TransactionStore;

use thiserror::Error;

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// No transaction carries this gateway reference.
    #[error("Transaction not found for payment intent {0}")]
    NotFound(String),

    /// A transaction with this gateway reference was already stored.
    #[error("Transaction already exists for payment intent {0}")]
    Duplicate(String),

    /// A card transaction was stored without a gateway reference.
    #[error("Card transaction {0} has no gateway reference")]
    MissingGatewayReference(uuid::Uuid),

    /// The requested status change is not allowed.
    #[error("Invalid transaction status transition: {from} -> {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },
}
