//! External collaborator traits and in-memory implementations for saga steps.

pub mod cart;
pub mod gateway;
pub mod search;
pub mod user;

pub use cart::{Cart, CartItem, CartService, InMemoryCartService};
pub use gateway::{CreatedIntent, InMemoryPaymentGateway, PaymentGateway, PaymentIntent, Refund};
pub use search::{InMemorySearchIndex, SearchIndex};
pub use user::{InMemoryUserService, UserProfile, UserService};
