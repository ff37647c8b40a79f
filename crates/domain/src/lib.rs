//! Service-owned stores of the checkout saga.
//!
//! This crate provides:
//! - Value objects shared by the services (Money, Sku, PaymentMethod)
//! - The Order Store with its transactional outbox
//! - The Transaction Store of the payment service
//! - The Stock Ledger of the catalog service with per-order reservation records
//!
//! Each store has an in-memory implementation; the relational stores also
//! have a PostgreSQL implementation.

pub mod catalog;
pub mod error;
pub mod order;
pub mod payment;
pub mod value_objects;

pub use catalog::{
    InMemoryStockLedger, ReleaseOutcome, Reservation, ReserveOutcome, StockError, StockLedger,
    StockLine, StockRecord, StockShortage,
};
pub use error::{DomainError, Result};
pub use order::{
    InMemoryOrderStore, Order, OrderError, OrderItem, OrderStatus, OrderStore, OutboxMessage,
    PostgresOrderStore,
};
pub use payment::{
    InMemoryTransactionStore, LinkOutcome, PostgresTransactionStore, Transaction,
    TransactionError, TransactionStatus, TransactionStore,
};
pub use value_objects::{Currency, Money, PaymentMethod, Sku};

/// Runs the schema migrations of the relational stores.
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
