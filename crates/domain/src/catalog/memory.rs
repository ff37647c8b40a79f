use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::OrderId;
use tokio::sync::RwLock;

use super::{
    ReleaseOutcome, Reservation, ReserveOutcome, StockError, StockLedger, StockLine, StockRecord,
    StockShortage, merge_lines,
};
use crate::{DomainError, Result, Sku};

#[derive(Default)]
struct State {
    stock: HashMap<Sku, u32>,
    reservations: HashMap<OrderId, Reservation>,
    unavailable: bool,
}

impl State {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(DomainError::Unavailable("stock ledger".to_string()));
        }
        Ok(())
    }

    fn record(&self, sku: &Sku) -> StockRecord {
        StockRecord::new(sku.clone(), self.stock.get(sku).copied().unwrap_or(0))
    }

    /// Returns the first line that cannot be served.
    fn shortage(&self, lines: &[StockLine]) -> Option<StockShortage> {
        lines.iter().find_map(|line| match self.stock.get(&line.sku) {
            None => Some(StockShortage::UnknownSku {
                sku: line.sku.clone(),
            }),
            Some(&available) if available < line.quantity => Some(StockShortage::Insufficient {
                sku: line.sku.clone(),
                requested: line.quantity,
                available,
            }),
            Some(_) => None,
        })
    }
}

/// In-memory stock ledger.
///
/// Reservation checks every line under one write lock before decrementing
/// anything, so a reservation is applied for all lines or for none.
#[derive(Clone, Default)]
pub struct InMemoryStockLedger {
    state: Arc<RwLock<State>>,
}

impl InMemoryStockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ledger seeded with the given stock.
    pub fn with_stock<I, S>(stock: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<Sku>,
    {
        let state = State {
            stock: stock.into_iter().map(|(sku, qty)| (sku.into(), qty)).collect(),
            ..State::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Sets the available quantity of a SKU.
    pub async fn set_stock(&self, sku: impl Into<Sku>, quantity: u32) {
        self.state.write().await.stock.insert(sku.into(), quantity);
    }

    /// Returns the available quantity of a SKU.
    pub async fn quantity(&self, sku: &str) -> Option<u32> {
        self.state.read().await.stock.get(&Sku::new(sku)).copied()
    }

    /// Configures every operation to fail with a transient error.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }
}

#[async_trait]
impl StockLedger for InMemoryStockLedger {
    async fn load(&self, skus: &[Sku]) -> Result<Vec<StockRecord>> {
        let state = self.state.read().await;
        state.check_available()?;

        Ok(skus
            .iter()
            .filter(|sku| state.stock.contains_key(*sku))
            .map(|sku| state.record(sku))
            .collect())
    }

    #[tracing::instrument(skip_all, fields(%order_id, lines = lines.len()))]
    async fn reserve(&self, order_id: OrderId, lines: &[StockLine]) -> Result<ReserveOutcome> {
        if lines.is_empty() {
            return Err(StockError::NoLines(order_id).into());
        }
        if let Some(line) = lines.iter().find(|line| line.quantity == 0) {
            return Err(StockError::InvalidQuantity {
                sku: line.sku.clone(),
                quantity: 0,
            }
            .into());
        }

        let mut state = self.state.write().await;
        state.check_available()?;

        match state.reservations.get(&order_id) {
            Some(Reservation::Reserved(_)) => return Ok(ReserveOutcome::AlreadyReserved),
            Some(Reservation::Rejected(shortage)) => {
                return Ok(ReserveOutcome::Rejected(shortage.clone()));
            }
            Some(Reservation::Released) => {
                return Ok(ReserveOutcome::Rejected(StockShortage::OrderReleased));
            }
            None => {}
        }

        let lines = merge_lines(lines);
        if let Some(shortage) = state.shortage(&lines) {
            state
                .reservations
                .insert(order_id, Reservation::Rejected(shortage.clone()));
            return Ok(ReserveOutcome::Rejected(shortage));
        }

        for line in &lines {
            if let Some(available) = state.stock.get_mut(&line.sku) {
                *available -= line.quantity;
            }
        }
        let updated = lines.iter().map(|line| state.record(&line.sku)).collect();
        state
            .reservations
            .insert(order_id, Reservation::Reserved(lines));

        Ok(ReserveOutcome::Reserved(updated))
    }

    #[tracing::instrument(skip_all, fields(%order_id))]
    async fn release(&self, order_id: OrderId) -> Result<ReleaseOutcome> {
        let mut state = self.state.write().await;
        state.check_available()?;

        let lines = match state.reservations.get(&order_id) {
            Some(Reservation::Reserved(lines)) => lines.clone(),
            Some(Reservation::Released) => return Ok(ReleaseOutcome::AlreadyReleased),
            Some(Reservation::Rejected(_)) => return Ok(ReleaseOutcome::NothingReserved),
            None => {
                state.reservations.insert(order_id, Reservation::Released);
                return Ok(ReleaseOutcome::NothingReserved);
            }
        };

        for line in &lines {
            *state.stock.entry(line.sku.clone()).or_default() += line.quantity;
        }
        let updated = lines.iter().map(|line| state.record(&line.sku)).collect();
        state.reservations.insert(order_id, Reservation::Released);

        Ok(ReleaseOutcome::Released(updated))
    }

    async fn reservation(&self, order_id: OrderId) -> Result<Option<Reservation>> {
        let state = self.state.read().await;
        state.check_available()?;
        Ok(state.reservations.get(&order_id).cloned())
    }
}
