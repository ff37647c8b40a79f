//! Choreographed checkout saga.
//!
//! This crate provides:
//! - The Order Saga Initiator, the synchronous entry point of checkout
//! - The Payment and Stock saga steps with their compensations
//! - The Order Finalizer and its status transition table
//! - The consumer runtime and the outbox relay
//!
//! The saga runs `orders.created -> payment.* -> stock.* -> orders.confirmed`.
//! Failures end in a failure event that cancels the order and triggers the
//! compensations (stock release, card refund).

pub mod checkout;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod finalizer;
pub mod initiator;
pub mod outbox;
pub mod payment;
pub mod services;
pub mod stock;

pub use checkout::{CheckoutSaga, Collaborators, ORDER_SERVICE, PAYMENT_SERVICE, PRODUCT_SERVICE};
pub use config::SagaConfig;
pub use consumer::{EventHandler, SagaConsumer};
pub use error::{Result, SagaError};
pub use events::{FAILURE_DETAIL, FAILURE_REASON, OrderData, OrderItemData};
pub use finalizer::{FinalizerEvent, OrderFinalizer, Transition, transition};
pub use initiator::{CreateOrder, CreatedOrder, OrderInitiator};
pub use outbox::OutboxRelay;
pub use payment::{OpenedIntent, PaymentFailure, PaymentOutcome, PaymentStep, RefundOutcome};
pub use services::{
    Cart, CartItem, CartService, CreatedIntent, InMemoryCartService, InMemoryPaymentGateway,
    InMemorySearchIndex, InMemoryUserService, PaymentGateway, PaymentIntent, Refund, SearchIndex,
    UserProfile, UserService,
};
pub use stock::{StockFailure, StockOutcome, StockStep};
