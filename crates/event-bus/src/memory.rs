use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    Acknowledger, Delivery, EventBus, EventBusError, EventEnvelope, Result, Subscription, Topic,
};

/// A message parked after it could not be handled.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub topic: Topic,
    pub group: String,
    pub envelope: EventEnvelope,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Default)]
struct GroupQueue {
    pending: Mutex<VecDeque<(EventEnvelope, u32)>>,
    in_flight: AtomicUsize,
    notify: Notify,
}

impl GroupQueue {
    fn push(&self, envelope: EventEnvelope, attempt: u32) {
        lock(&self.pending).push_back((envelope, attempt));
        self.notify.notify_one();
    }

    fn settle(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn outstanding(&self) -> usize {
        lock(&self.pending).len() + self.in_flight.load(Ordering::SeqCst)
    }
}

/// Envelopes retained per topic for late subscribers.
pub const DEFAULT_LOG_RETENTION: usize = 10_000;

struct BusState {
    log: HashMap<Topic, VecDeque<EventEnvelope>>,
    log_retention: usize,
    groups: HashMap<(Topic, String), Arc<GroupQueue>>,
    dead_letters: Vec<DeadLetter>,
    fail_on_publish: bool,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            log: HashMap::new(),
            log_retention: DEFAULT_LOG_RETENTION,
            groups: HashMap::new(),
            dead_letters: Vec::new(),
            fail_on_publish: false,
        }
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<BusState>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory event bus for tests and single-process deployments.
///
/// The bus retains the most recent published envelopes per topic, up to
/// [`DEFAULT_LOG_RETENTION`] unless configured otherwise. A consumer group
/// that subscribes late replays the retained tail, and unsettled or nacked
/// deliveries are queued again with a bumped attempt. Nothing survives a
/// restart, so the bus must not be paired with durable stores.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    inner: Arc<Inner>,
}

impl InMemoryEventBus {
    /// Creates a new empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps how many envelopes are retained per topic. Zero retains none.
    pub fn with_log_retention(self, per_topic: usize) -> Self {
        lock(&self.inner.state).log_retention = per_topic;
        self
    }

    /// Configures the bus to reject publishes.
    pub fn set_fail_on_publish(&self, fail: bool) {
        lock(&self.inner.state).fail_on_publish = fail;
    }

    /// Returns the retained envelopes published to `topic`, oldest first.
    pub fn published(&self, topic: Topic) -> Vec<EventEnvelope> {
        lock(&self.inner.state)
            .log
            .get(&topic)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the envelopes published to `topic` under partition key `key`.
    pub fn published_for(&self, topic: Topic, key: &str) -> Vec<EventEnvelope> {
        self.published(topic)
            .into_iter()
            .filter(|e| e.key == key)
            .collect()
    }

    /// Returns all dead-lettered messages.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.inner.state).dead_letters.clone()
    }

    /// Returns true when no consumer group has queued or in-flight messages.
    pub fn is_idle(&self) -> bool {
        lock(&self.inner.state)
            .groups
            .values()
            .all(|queue| queue.outstanding() == 0)
    }

    /// Closes the bus. Waiting subscriptions return None.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        for queue in lock(&self.inner.state).groups.values() {
            queue.notify.notify_waiters();
            queue.notify.notify_one();
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        let topic = envelope.topic()?;
        let mut state = lock(&self.inner.state);

        if state.fail_on_publish {
            return Err(EventBusError::PublishFailed {
                topic,
                reason: "bus unavailable".to_string(),
            });
        }

        for ((group_topic, _), queue) in &state.groups {
            if *group_topic == topic {
                queue.push(envelope.clone(), 1);
            }
        }
        let retention = state.log_retention;
        let log = state.log.entry(topic).or_default();
        log.push_back(envelope);
        while log.len() > retention {
            log.pop_front();
        }
        metrics::counter!("event_bus_published_total", "topic" => topic.as_str()).increment(1);

        Ok(())
    }

    async fn subscribe(&self, topic: Topic, group: &str) -> Result<Box<dyn Subscription>> {
        let mut state = lock(&self.inner.state);
        let key = (topic, group.to_string());

        let queue = match state.groups.get(&key) {
            Some(queue) => queue.clone(),
            None => {
                let queue = Arc::new(GroupQueue::default());
                // New groups start from the beginning of the retained log.
                for envelope in state.log.get(&topic).into_iter().flatten() {
                    queue.push(envelope.clone(), 1);
                }
                state.groups.insert(key, queue.clone());
                queue
            }
        };

        tracing::debug!(%topic, group, "consumer group attached");

        Ok(Box::new(InMemorySubscription {
            topic,
            group: group.to_string(),
            queue,
            inner: self.inner.clone(),
        }))
    }
}

struct InMemorySubscription {
    topic: Topic,
    group: String,
    queue: Arc<GroupQueue>,
    inner: Arc<Inner>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn recv(&mut self) -> Result<Option<Delivery>> {
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let next = lock(&self.queue.pending).pop_front();
            if let Some((envelope, attempt)) = next {
                self.queue.in_flight.fetch_add(1, Ordering::SeqCst);
                let acker = InMemoryAcknowledger {
                    topic: self.topic,
                    group: self.group.clone(),
                    queue: self.queue.clone(),
                    inner: self.inner.clone(),
                };
                return Ok(Some(Delivery::new(envelope, attempt, Box::new(acker))));
            }

            self.queue.notify.notified().await;
        }
    }
}

struct InMemoryAcknowledger {
    topic: Topic,
    group: String,
    queue: Arc<GroupQueue>,
    inner: Arc<Inner>,
}

impl InMemoryAcknowledger {
    fn requeue(&self, envelope: EventEnvelope, attempt: u32) {
        self.queue.push(envelope, attempt + 1);
        self.queue.settle();
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcknowledger {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.queue.settle();
        Ok(())
    }

    async fn nack(self: Box<Self>, envelope: EventEnvelope, attempt: u32) -> Result<()> {
        self.requeue(envelope, attempt);
        Ok(())
    }

    async fn dead_letter(
        self: Box<Self>,
        envelope: EventEnvelope,
        attempt: u32,
        reason: String,
    ) -> Result<()> {
        tracing::warn!(
            topic = %self.topic,
            group = %self.group,
            attempt,
            reason = %reason,
            "message dead-lettered"
        );
        metrics::counter!("event_bus_dead_letters_total", "topic" => self.topic.as_str())
            .increment(1);
        lock(&self.inner.state).dead_letters.push(DeadLetter {
            topic: self.topic,
            group: self.group.clone(),
            envelope,
            attempts: attempt,
            reason,
        });
        self.queue.settle();
        Ok(())
    }

    fn abandon(self: Box<Self>, envelope: EventEnvelope, attempt: u32) {
        self.requeue(envelope, attempt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(topic: Topic, key: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .topic(topic)
            .key(key)
            .payload_raw(serde_json::json!({"key": key}))
            .build()
            .unwrap()
    }

    async fn next(sub: &mut Box<dyn Subscription>) -> Delivery {
        sub.recv().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn every_group_sees_every_message() {
        let bus = InMemoryEventBus::new();
        let mut payments = bus
            .subscribe(Topic::OrdersCreated, "payment-service-orders.created")
            .await
            .unwrap();
        let mut audit = bus
            .subscribe(Topic::OrdersCreated, "audit-orders.created")
            .await
            .unwrap();

        bus.publish(envelope(Topic::OrdersCreated, "1")).await.unwrap();

        let a = next(&mut payments).await;
        let b = next(&mut audit).await;
        assert_eq!(a.envelope().key, "1");
        assert_eq!(b.envelope().key, "1");
        a.ack().await.unwrap();
        b.ack().await.unwrap();
        assert!(bus.is_idle());
    }

    #[tokio::test]
    async fn late_group_replays_retained_log() {
        let bus = InMemoryEventBus::new();
        bus.publish(envelope(Topic::StockReserved, "1")).await.unwrap();
        bus.publish(envelope(Topic::StockReserved, "2")).await.unwrap();

        let mut sub = bus.subscribe(Topic::StockReserved, "late").await.unwrap();
        assert_eq!(next(&mut sub).await.envelope().key, "1");
        assert_eq!(next(&mut sub).await.envelope().key, "2");
    }

    #[tokio::test]
    async fn log_keeps_only_the_retained_tail() {
        let bus = InMemoryEventBus::new().with_log_retention(2);
        let mut early = bus.subscribe(Topic::StockReserved, "early").await.unwrap();
        for key in ["1", "2", "3"] {
            bus.publish(envelope(Topic::StockReserved, key)).await.unwrap();
        }

        let keys: Vec<_> = bus
            .published(Topic::StockReserved)
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, ["2", "3"]);

        // Attached groups still receive everything published after they joined.
        for key in ["1", "2", "3"] {
            let delivery = next(&mut early).await;
            assert_eq!(delivery.envelope().key, key);
            delivery.ack().await.unwrap();
        }

        let mut late = bus.subscribe(Topic::StockReserved, "late").await.unwrap();
        assert_eq!(next(&mut late).await.envelope().key, "2");
        assert_eq!(next(&mut late).await.envelope().key, "3");
    }

    #[tokio::test]
    async fn members_of_a_group_compete() {
        let bus = InMemoryEventBus::new();
        let mut first = bus.subscribe(Topic::PaymentFailed, "g").await.unwrap();
        let mut second = bus.subscribe(Topic::PaymentFailed, "g").await.unwrap();

        bus.publish(envelope(Topic::PaymentFailed, "1")).await.unwrap();
        bus.publish(envelope(Topic::PaymentFailed, "2")).await.unwrap();

        let a = next(&mut first).await;
        let b = next(&mut second).await;
        assert_ne!(a.envelope().key, b.envelope().key);
        a.ack().await.unwrap();
        b.ack().await.unwrap();
        assert!(bus.is_idle());
    }

    #[tokio::test]
    async fn nack_redelivers_with_next_attempt() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe(Topic::OrdersCreated, "g").await.unwrap();
        bus.publish(envelope(Topic::OrdersCreated, "1")).await.unwrap();

        let first = next(&mut sub).await;
        assert_eq!(first.attempt(), 1);
        first.nack().await.unwrap();

        let second = next(&mut sub).await;
        assert_eq!(second.attempt(), 2);
        assert_eq!(second.envelope().key, "1");
        second.ack().await.unwrap();
        assert!(bus.is_idle());
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe(Topic::OrdersCreated, "g").await.unwrap();
        bus.publish(envelope(Topic::OrdersCreated, "1")).await.unwrap();

        drop(next(&mut sub).await);

        let again = next(&mut sub).await;
        assert_eq!(again.attempt(), 2);
        again.ack().await.unwrap();
    }

    #[tokio::test]
    async fn dead_letter_parks_message() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe(Topic::OrdersCreated, "g").await.unwrap();
        bus.publish(envelope(Topic::OrdersCreated, "1")).await.unwrap();

        next(&mut sub).await.dead_letter("malformed").await.unwrap();

        let dead = bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].group, "g");
        assert_eq!(dead[0].reason, "malformed");
        assert!(bus.is_idle());
    }

    #[tokio::test]
    async fn failing_publish_is_reported_and_not_retained() {
        let bus = InMemoryEventBus::new();
        bus.set_fail_on_publish(true);

        let err = bus
            .publish(envelope(Topic::OrdersCreated, "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::PublishFailed { .. }));
        assert!(bus.published(Topic::OrdersCreated).is_empty());
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe(Topic::OrdersCreated, "g").await.unwrap();
        bus.close();
        assert!(sub.recv().await.unwrap().is_none());
    }
}
