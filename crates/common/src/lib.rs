//! Identifiers shared by every service taking part in the checkout saga.

mod types;

pub use types::{OrderId, UserId};
