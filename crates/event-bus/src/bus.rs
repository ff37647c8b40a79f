use async_trait::async_trait;

use crate::{EventEnvelope, Result, Topic};

/// Core trait for event bus implementations.
///
/// The bus is a durable, partitioned log with at-least-once delivery.
/// Every consumer group sees every message of a topic; instances within one
/// group compete for deliveries.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an envelope to the topic named by its `event_type`.
    ///
    /// Returns once the bus has durably accepted the event.
    async fn publish(&self, envelope: EventEnvelope) -> Result<()>;

    /// Attaches to `topic` as a member of consumer group `group`.
    async fn subscribe(&self, topic: Topic, group: &str) -> Result<Box<dyn Subscription>>;
}

/// A consumer group membership yielding deliveries.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery.
    ///
    /// Returns None once the bus is closed.
    async fn recv(&mut self) -> Result<Option<Delivery>>;
}

/// Settles a delivery with the bus that produced it.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// The message was handled and must not be delivered to this group again.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// The message was not handled and must be delivered again.
    async fn nack(self: Box<Self>, envelope: EventEnvelope, attempt: u32) -> Result<()>;

    /// The message can never be handled and is parked for operators.
    async fn dead_letter(
        self: Box<Self>,
        envelope: EventEnvelope,
        attempt: u32,
        reason: String,
    ) -> Result<()>;

    /// The delivery was dropped unsettled.
    fn abandon(self: Box<Self>, envelope: EventEnvelope, attempt: u32);
}

/// A single delivery of an envelope to a consumer group.
///
/// Dropping a delivery without settling it makes the bus redeliver it.
pub struct Delivery {
    envelope: EventEnvelope,
    attempt: u32,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// Creates a delivery. `attempt` starts at 1.
    pub fn new(envelope: EventEnvelope, attempt: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            attempt,
            acker: Some(acker),
        }
    }

    /// Returns the delivered envelope.
    pub fn envelope(&self) -> &EventEnvelope {
        &self.envelope
    }

    /// Returns how many times this envelope has been delivered to the group.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Acknowledges successful handling.
    pub async fn ack(mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Requests redelivery.
    pub async fn nack(mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.nack(self.envelope.clone(), self.attempt).await,
            None => Ok(()),
        }
    }

    /// Parks the message on the dead-letter queue.
    pub async fn dead_letter(mut self, reason: impl Into<String>) -> Result<()> {
        match self.acker.take() {
            Some(acker) => {
                acker
                    .dead_letter(self.envelope.clone(), self.attempt, reason.into())
                    .await
            }
            None => Ok(()),
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.abandon(self.envelope.clone(), self.attempt);
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("event_id", &self.envelope.event_id)
            .field("event_type", &self.envelope.event_type)
            .field("attempt", &self.attempt)
            .finish()
    }
}
