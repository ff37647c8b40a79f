//! Saga runtime settings.

use std::time::Duration;

/// Timeouts and retry policy of the saga steps and consumers.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Upper bound of every blocking call (gateway, stores, cart, profile, publish).
    pub call_timeout: Duration,
    /// Upper bound of handling one delivery end to end.
    pub handler_timeout: Duration,
    /// Deliveries after which a transient failure is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Pause before a failed delivery is handed back to the bus.
    pub retry_backoff: Duration,
    /// How often the outbox relay polls for unpublished messages.
    pub outbox_poll_interval: Duration,
    /// Messages the outbox relay publishes per poll.
    pub outbox_batch_size: usize,
    /// How long published outbox messages are kept before the relay purges them.
    pub outbox_retention: chrono::Duration,
    /// Time between order date and estimated delivery.
    pub delivery_estimate: chrono::Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(5000),
            handler_timeout: Duration::from_millis(15000),
            max_delivery_attempts: 5,
            retry_backoff: Duration::from_millis(100),
            outbox_poll_interval: Duration::from_millis(500),
            outbox_batch_size: 100,
            outbox_retention: chrono::Duration::hours(24),
            delivery_estimate: chrono::Duration::hours(72),
        }
    }
}

impl SagaConfig {
    /// Backoff before redelivery, growing linearly with the attempt up to ten steps.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff * attempt.clamp(1, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SagaConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.handler_timeout, Duration::from_secs(15));
        assert_eq!(config.max_delivery_attempts, 5);
        assert_eq!(config.outbox_poll_interval, Duration::from_millis(500));
        assert_eq!(config.delivery_estimate, chrono::Duration::hours(72));
        assert_eq!(config.outbox_retention, chrono::Duration::hours(24));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = SagaConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(3), Duration::from_millis(300));
        assert_eq!(config.backoff(50), Duration::from_millis(1000));
    }
}
