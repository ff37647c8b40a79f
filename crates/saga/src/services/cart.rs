//! Cart collaborator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::UserId;
use domain::{Money, Sku};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::SagaError;

/// A line of a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub sku: Sku,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl CartItem {
    pub fn new(
        sku: impl Into<Sku>,
        name: impl Into<String>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        Self {
            sku: sku.into(),
            name: name.into(),
            quantity,
            unit_price,
        }
    }
}

/// Contents of a cart as reported by the cart service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub items: Vec<CartItem>,
    pub total_price: Money,
}

impl Cart {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of quantity times unit price over all lines.
    pub fn line_total(&self) -> Money {
        self.items
            .iter()
            .map(|item| item.unit_price.multiply(item.quantity))
            .sum()
    }
}

/// Trait for cart operations.
#[async_trait]
pub trait CartService: Send + Sync {
    /// Returns the current cart of a user.
    async fn get_cart(&self, user_id: UserId) -> Result<Cart, SagaError>;

    /// Removes every item from the cart of a user.
    async fn clear_cart(&self, user_id: UserId) -> Result<(), SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryCartState {
    carts: HashMap<UserId, Vec<CartItem>>,
    fail_on_get: bool,
    fail_on_clear: bool,
}

/// In-memory cart service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCartService {
    state: Arc<RwLock<InMemoryCartState>>,
}

impl InMemoryCartService {
    /// Creates a new in-memory cart service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an item to a user's cart.
    pub async fn add_item(&self, user_id: UserId, item: CartItem) {
        self.state
            .write()
            .await
            .carts
            .entry(user_id)
            .or_default()
            .push(item);
    }

    /// Returns the items in a user's cart.
    pub async fn items(&self, user_id: UserId) -> Vec<CartItem> {
        self.state
            .read()
            .await
            .carts
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Configures the service to fail when a cart is read.
    pub async fn set_fail_on_get(&self, fail: bool) {
        self.state.write().await.fail_on_get = fail;
    }

    /// Configures the service to fail when a cart is cleared.
    pub async fn set_fail_on_clear(&self, fail: bool) {
        self.state.write().await.fail_on_clear = fail;
    }
}

#[async_trait]
impl CartService for InMemoryCartService {
    async fn get_cart(&self, user_id: UserId) -> Result<Cart, SagaError> {
        let state = self.state.read().await;
        if state.fail_on_get {
            return Err(SagaError::collaborator("cart", "cart unavailable"));
        }

        let items = state.carts.get(&user_id).cloned().unwrap_or_default();
        let mut cart = Cart {
            items,
            total_price: Money::zero(),
        };
        cart.total_price = cart.line_total();
        Ok(cart)
    }

    async fn clear_cart(&self, user_id: UserId) -> Result<(), SagaError> {
        let mut state = self.state.write().await;
        if state.fail_on_clear {
            return Err(SagaError::collaborator("cart", "cart unavailable"));
        }
        state.carts.remove(&user_id);
        Ok(())
    }
}
