//! Event plumbing for the checkout saga.
//!
//! This crate provides:
//! - The envelope every saga fact travels in, with deterministic event ids
//! - The topic catalogue and consumer group naming
//! - An at-least-once EventBus abstraction with explicit delivery settlement
//! - The consumer-side Inbox of processed event ids

pub mod bus;
pub mod error;
pub mod event;
pub mod inbox;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod postgres;
pub mod topic;

pub use bus::{Acknowledger, Delivery, EventBus, Subscription};
pub use error::{EventBusError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, SCHEMA_VERSION};
pub use inbox::{InMemoryInbox, Inbox};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaEventBus, KafkaEventBusConfig};
pub use memory::{DeadLetter, InMemoryEventBus};
pub use postgres::PostgresInbox;
pub use topic::Topic;
