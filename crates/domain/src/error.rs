//! Domain error types.

use thiserror::Error;

use crate::catalog::StockError;
use crate::order::OrderError;
use crate::payment::TransactionError;

/// Errors that can occur in the service-owned stores.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the order store.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    /// An error occurred in the transaction store.
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// An error occurred in the stock ledger.
    #[error("Stock error: {0}")]
    Stock(#[from] StockError),

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Running the schema migrations failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored value could not be decoded.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// Returns true when retrying the operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DomainError::Unavailable(_) => true,
            DomainError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;
    use common::OrderId;

    #[test]
    fn test_transient_classification() {
        assert!(DomainError::Unavailable("orders".into()).is_transient());
        assert!(DomainError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!DomainError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!DomainError::Order(OrderError::NotFound(OrderId::new(1))).is_transient());
    }
}
