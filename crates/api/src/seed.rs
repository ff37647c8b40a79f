//! Start-up data for the in-process collaborators.
//!
//! The stock ledger, carts and user profiles are external systems in
//! production. When the binary runs them in process, a seed file fills them
//! so checkouts can succeed.

use std::path::{Path, PathBuf};

use common::UserId;
use domain::{InMemoryStockLedger, Money};
use saga::{CartItem, InMemoryCartService, InMemoryUserService, UserProfile};
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading a seed file.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to read seed file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid seed file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Stock on hand for one SKU.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedStock {
    pub sku: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedUser {
    pub user_id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedCartItem {
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// The cart contents of one user.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedCart {
    pub user_id: UserId,
    pub items: Vec<SeedCartItem>,
}

/// Contents of a seed file. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Seed {
    #[serde(default)]
    pub stock: Vec<SeedStock>,
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub carts: Vec<SeedCart>,
}

impl Seed {
    /// Reads and parses a JSON seed file.
    pub fn load(path: &Path) -> Result<Self, SeedError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SeedError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| SeedError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fills the collaborators. Stock levels are overwritten and cart items
    /// are added to whatever the carts already hold.
    pub async fn apply(
        &self,
        ledger: &InMemoryStockLedger,
        cart: &InMemoryCartService,
        users: &InMemoryUserService,
    ) {
        for stock in &self.stock {
            ledger.set_stock(stock.sku.clone(), stock.quantity).await;
        }
        for user in &self.users {
            let profile = UserProfile::new(&user.first_name, &user.last_name, &user.email);
            users.insert(user.user_id, profile).await;
        }
        for seeded in &self.carts {
            for item in &seeded.items {
                let unit_price = Money::from_cents(item.unit_price_cents);
                let item = CartItem::new(item.sku.clone(), &item.name, item.quantity, unit_price);
                cart.add_item(seeded.user_id, item).await;
            }
        }

        tracing::info!(
            skus = self.stock.len(),
            users = self.users.len(),
            carts = self.carts.len(),
            "seed data applied"
        );
    }
}
