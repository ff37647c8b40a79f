//! Consumer runtime driving the saga steps from the event bus.
//!
//! Each listener owns one subscription and spawns a task per delivery, so a
//! slow gateway or store call never holds up the next message. Tasks are
//! tracked, which lets [`SagaConsumer::shutdown`] wait for in-flight work.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use event_bus::{Delivery, EventBus, EventEnvelope, Inbox, Subscription, Topic};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::config::SagaConfig;
use crate::error::{Result, bounded};
use crate::outbox::OutboxRelay;

/// A saga step reacting to envelopes of the topics it is registered for.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one envelope.
    ///
    /// Must be idempotent: the same envelope may be handled again after a
    /// crash between handling and acknowledgement.
    async fn handle(&self, envelope: &EventEnvelope) -> Result<()>;
}

/// Runs listeners and background tasks until shut down.
pub struct SagaConsumer {
    bus: Arc<dyn EventBus>,
    inbox: Arc<dyn Inbox>,
    config: SagaConfig,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl SagaConsumer {
    pub fn new(bus: Arc<dyn EventBus>, inbox: Arc<dyn Inbox>, config: SagaConfig) -> Self {
        Self {
            bus,
            inbox,
            config,
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    /// Subscribes `service` to `topic` and hands every delivery to `handler`.
    ///
    /// The consumer group is `{service}-{topic}`. Returns once subscribed.
    pub async fn listen(
        &self,
        service: &str,
        topic: Topic,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let group = topic.consumer_group(service);
        let subscription = self.bus.subscribe(topic, &group).await?;
        tracing::info!(%topic, %group, "listener started");

        let listener = Arc::new(Listener {
            topic,
            group,
            handler,
            inbox: self.inbox.clone(),
            config: self.config.clone(),
            token: self.token.clone(),
        });
        let tracker = self.tracker.clone();
        self.tracker.spawn(listener.receive_loop(subscription, tracker));

        Ok(())
    }

    /// Runs the outbox relay until shutdown.
    pub fn spawn_relay(&self, relay: Arc<OutboxRelay>) {
        let token = self.token.clone();
        let interval = self.config.outbox_poll_interval;
        self.tracker
            .spawn(async move { relay.run(interval, token).await });
    }

    /// Returns the token that stops intake when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stops intake and waits for in-flight deliveries to settle.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("saga consumers stopped");
    }
}

enum Handled {
    Processed,
    Duplicate,
}

struct Listener {
    topic: Topic,
    group: String,
    handler: Arc<dyn EventHandler>,
    inbox: Arc<dyn Inbox>,
    config: SagaConfig,
    token: CancellationToken,
}

impl Listener {
    async fn receive_loop(
        self: Arc<Self>,
        mut subscription: Box<dyn Subscription>,
        tracker: TaskTracker,
    ) {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => break,
                next = subscription.recv() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    let listener = self.clone();
                    tracker.spawn(async move { listener.process(delivery).await });
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        topic = %self.topic,
                        group = %self.group,
                        error = %e,
                        "receive failed"
                    );
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
            }
        }

        tracing::info!(topic = %self.topic, group = %self.group, "listener stopped");
    }

    async fn process(&self, delivery: Delivery) {
        let span = tracing::info_span!(
            "saga_message",
            topic = %self.topic,
            group = %self.group,
            event_id = %delivery.envelope().event_id,
            attempt = delivery.attempt(),
        );
        self.settle(delivery).instrument(span).await
    }

    async fn settle(&self, delivery: Delivery) {
        let attempt = delivery.attempt();
        let started = Instant::now();
        let outcome = self.handle_once(delivery.envelope()).await;
        metrics::histogram!("saga_handler_duration_seconds", "topic" => self.topic.as_str())
            .record(started.elapsed().as_secs_f64());

        let (result, settled) = match outcome {
            Ok(Handled::Processed) => ("processed", delivery.ack().await),
            Ok(Handled::Duplicate) => {
                tracing::debug!("duplicate delivery acknowledged");
                ("duplicate", delivery.ack().await)
            }
            Err(e) if e.is_transient() && attempt < self.config.max_delivery_attempts => {
                tracing::warn!(error = %e, "handler failed, message will be redelivered");
                let cancelled = tokio::select! {
                    _ = self.token.cancelled() => true,
                    _ = tokio::time::sleep(self.config.backoff(attempt)) => false,
                };
                if cancelled {
                    // Dropped unsettled, so the bus redelivers it.
                    drop(delivery);
                    ("abandoned", Ok(()))
                } else {
                    ("retried", delivery.nack().await)
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "handler failed permanently, message dead-lettered");
                ("dead_lettered", delivery.dead_letter(e.to_string()).await)
            }
        };

        metrics::counter!(
            "saga_messages_total",
            "topic" => self.topic.as_str(),
            "result" => result
        )
        .increment(1);

        if let Err(e) = settled {
            tracing::warn!(error = %e, "failed to settle delivery");
        }
    }

    async fn handle_once(&self, envelope: &EventEnvelope) -> Result<Handled> {
        let timeout = self.config.call_timeout;
        let event_id = envelope.event_id;

        let processed = self.inbox.is_processed(&self.group, event_id);
        if bounded("inbox_check", timeout, processed).await? {
            return Ok(Handled::Duplicate);
        }

        bounded(
            "handle",
            self.config.handler_timeout,
            self.handler.handle(envelope),
        )
        .await?;

        bounded(
            "inbox_mark",
            timeout,
            self.inbox.mark_processed(&self.group, event_id),
        )
        .await?;

        Ok(Handled::Processed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::error::SagaError;
    use event_bus::{InMemoryEventBus, InMemoryInbox};

    /// Counts calls and fails the first `failures` of them.
    struct ScriptedHandler {
        calls: AtomicUsize,
        failures: usize,
        transient: bool,
    }

    impl ScriptedHandler {
        fn new(failures: usize, transient: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
                transient,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        async fn handle(&self, _envelope: &EventEnvelope) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.transient {
                    SagaError::collaborator("gateway", "503")
                } else {
                    SagaError::UnhandledTopic("test".to_string())
                });
            }
            Ok(())
        }
    }

    fn config() -> SagaConfig {
        SagaConfig {
            retry_backoff: Duration::from_millis(1),
            max_delivery_attempts: 3,
            ..SagaConfig::default()
        }
    }

    fn envelope(key: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .topic(Topic::OrdersCreated)
            .key(key)
            .payload_raw(serde_json::json!({"key": key}))
            .build()
            .unwrap()
    }

    async fn wait_idle(bus: &InMemoryEventBus) {
        for _ in 0..400 {
            if bus.is_idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("bus never became idle");
    }

    async fn consumer_with(
        handler: Arc<dyn EventHandler>,
    ) -> (SagaConsumer, InMemoryEventBus, InMemoryInbox) {
        let bus = InMemoryEventBus::new();
        let inbox = InMemoryInbox::new();
        let consumer =
            SagaConsumer::new(Arc::new(bus.clone()), Arc::new(inbox.clone()), config());
        consumer
            .listen("payment-service", Topic::OrdersCreated, handler)
            .await
            .unwrap();
        (consumer, bus, inbox)
    }

    #[tokio::test]
    async fn handles_and_records_each_message() {
        let handler = ScriptedHandler::new(0, true);
        let (consumer, bus, inbox) = consumer_with(handler.clone()).await;

        bus.publish(envelope("1")).await.unwrap();
        bus.publish(envelope("2")).await.unwrap();
        wait_idle(&bus).await;

        assert_eq!(handler.calls(), 2);
        assert_eq!(inbox.len().await, 2);
        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn redelivered_event_id_is_handled_once() {
        let handler = ScriptedHandler::new(0, true);
        let (consumer, bus, _inbox) = consumer_with(handler.clone()).await;

        let first = envelope("1");
        bus.publish(first.clone()).await.unwrap();
        wait_idle(&bus).await;
        bus.publish(first).await.unwrap();
        wait_idle(&bus).await;

        assert_eq!(handler.calls(), 1);
        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let handler = ScriptedHandler::new(2, true);
        let (consumer, bus, _inbox) = consumer_with(handler.clone()).await;

        bus.publish(envelope("1")).await.unwrap();
        wait_idle(&bus).await;

        assert_eq!(handler.calls(), 3);
        assert!(bus.dead_letters().is_empty());
        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failure_is_dead_lettered_after_max_attempts() {
        let handler = ScriptedHandler::new(usize::MAX, true);
        let (consumer, bus, inbox) = consumer_with(handler.clone()).await;

        bus.publish(envelope("1")).await.unwrap();
        wait_idle(&bus).await;

        assert_eq!(handler.calls(), 3);
        let dead = bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].group, "payment-service-orders.created");
        assert!(inbox.is_empty().await);
        consumer.shutdown().await;
    }

    #[tokio::test]
    async fn permanent_failure_is_dead_lettered_at_once() {
        let handler = ScriptedHandler::new(1, false);
        let (consumer, bus, _inbox) = consumer_with(handler.clone()).await;

        bus.publish(envelope("1")).await.unwrap();
        wait_idle(&bus).await;

        assert_eq!(handler.calls(), 1);
        assert_eq!(bus.dead_letters().len(), 1);
        consumer.shutdown().await;
    }

    /// Signals when a call starts, then takes `delay` to finish.
    struct SlowHandler {
        started: tokio::sync::Notify,
        completed: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl EventHandler for SlowHandler {
        async fn handle(&self, _envelope: &EventEnvelope) -> Result<()> {
            self.started.notify_one();
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_handlers() {
        let handler = Arc::new(SlowHandler {
            started: tokio::sync::Notify::new(),
            completed: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
        });
        let (consumer, bus, inbox) = consumer_with(handler.clone()).await;

        bus.publish(envelope("1")).await.unwrap();
        handler.started.notified().await;
        consumer.shutdown().await;

        assert_eq!(handler.completed.load(Ordering::SeqCst), 1);
        assert_eq!(inbox.len().await, 1);
        assert!(bus.is_idle());
        assert!(bus.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_intake() {
        let handler = ScriptedHandler::new(0, true);
        let (consumer, bus, _inbox) = consumer_with(handler.clone()).await;

        consumer.shutdown().await;
        assert!(consumer.cancellation_token().is_cancelled());

        bus.publish(envelope("1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.calls(), 0);
        assert!(!bus.is_idle());
    }
}
