//! Search index collaborator mirroring the stock ledger.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{Sku, StockRecord};
use tokio::sync::RwLock;

use crate::error::SagaError;

/// Trait for the secondary search index of the catalog.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Upserts the stock fields of the given products.
    async fn index_stock(&self, records: &[StockRecord]) -> Result<(), SagaError>;
}

#[derive(Debug, Default)]
struct InMemorySearchState {
    documents: HashMap<Sku, StockRecord>,
    fail_on_index: bool,
}

/// In-memory search index for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemorySearchIndex {
    state: Arc<RwLock<InMemorySearchState>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the indexed document of a product.
    pub async fn document(&self, sku: &str) -> Option<StockRecord> {
        self.state.read().await.documents.get(&Sku::new(sku)).cloned()
    }

    /// Configures indexing to fail.
    pub async fn set_fail_on_index(&self, fail: bool) {
        self.state.write().await.fail_on_index = fail;
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn index_stock(&self, records: &[StockRecord]) -> Result<(), SagaError> {
        let mut state = self.state.write().await;
        if state.fail_on_index {
            return Err(SagaError::collaborator("search", "index unavailable"));
        }
        for record in records {
            state.documents.insert(record.sku.clone(), record.clone());
        }
        Ok(())
    }
}
