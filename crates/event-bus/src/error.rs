use thiserror::Error;

use crate::Topic;

/// Errors that can occur when interacting with the event bus.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The bus refused or failed to persist a published event.
    #[error("Publish to '{topic}' failed: {reason}")]
    PublishFailed { topic: Topic, reason: String },

    /// A consumer group could not be attached to a topic.
    #[error("Subscription of group '{group}' to '{topic}' failed: {reason}")]
    SubscriptionFailed {
        topic: Topic,
        group: String,
        reason: String,
    },

    /// The broker client failed outside a publish or settlement.
    #[error("Broker error: {0}")]
    Broker(String),

    /// A delivery could not be settled (acked, nacked or dead-lettered).
    #[error("Settlement failed: {0}")]
    SettlementFailed(String),

    /// The event type is not a known topic.
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// An envelope was built without a required field.
    #[error("Incomplete envelope: missing {0}")]
    IncompleteEnvelope(&'static str),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;
