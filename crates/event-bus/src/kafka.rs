//! Kafka-backed event bus.
//!
//! Every [`Topic`] is a Kafka topic of the same name and the envelope key is
//! the message key, so the events of one order stay ordered in a partition.
//! Redeliveries go through a per-group retry topic `{group}.retry` and parked
//! messages through `{topic}.dlq`.
//!
//! Offsets are committed manually. A partition's committed offset only moves
//! past a message once every earlier message of that partition was settled,
//! so anything dropped unsettled is delivered again after a restart or a
//! rebalance.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};

use crate::{
    Acknowledger, Delivery, EventBus, EventBusError, EventEnvelope, Result, Subscription, Topic,
};

const ATTEMPT_HEADER: &str = "saga-attempt";
const GROUP_HEADER: &str = "saga-group";
const REASON_HEADER: &str = "saga-dead-letter-reason";

/// Configuration for the Kafka connection.
#[derive(Clone, Debug)]
pub struct KafkaEventBusConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// How long the producer may take to get a message acknowledged.
    pub message_timeout: Duration,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

impl KafkaEventBusConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            message_timeout: Duration::from_secs(5),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }

    /// Set security protocol.
    pub fn with_security_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.security_protocol = Some(protocol.into());
        self
    }

    /// Add SASL authentication over TLS.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// The topic a consumer group's redeliveries are published to.
    pub fn retry_topic(group: &str) -> String {
        format!("{group}.retry")
    }

    /// The topic messages of `topic` are parked on.
    pub fn dead_letter_topic(topic: &str) -> String {
        format!("{topic}.dlq")
    }

    fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set(
            "message.timeout.ms",
            self.message_timeout.as_millis().to_string(),
        );
        config.set("acks", "all");
        config.set("enable.idempotence", "true");

        self.apply_security_config(&mut config);
        config
    }

    fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("group.id", group);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "earliest");
        config.set("allow.auto.create.topics", "true");

        self.apply_security_config(&mut config);
        config
    }

    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }
        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn attempt_headers(attempt: u32) -> OwnedHeaders {
    let attempt = attempt.to_string();
    OwnedHeaders::new().insert(Header {
        key: ATTEMPT_HEADER,
        value: Some(attempt.as_str()),
    })
}

fn attempt_from<H: Headers + ?Sized>(headers: &H) -> Option<u32> {
    (0..headers.count())
        .map(|idx| headers.get(idx))
        .find(|header| header.key == ATTEMPT_HEADER)
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
        .and_then(|value| value.parse().ok())
        .filter(|attempt| *attempt > 0)
}

/// Kafka event bus implementation.
///
/// Publishing waits for the full in-sync replica set (`acks=all`). Each
/// [`EventBus::subscribe`] call creates one member of the consumer group.
#[derive(Clone)]
pub struct KafkaEventBus {
    producer: FutureProducer,
    config: Arc<KafkaEventBusConfig>,
}

impl KafkaEventBus {
    /// Creates the producer. Brokers are contacted lazily.
    pub fn new(config: KafkaEventBusConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .producer_config()
            .create()
            .map_err(|e| EventBusError::Broker(format!("failed to create producer: {e}")))?;

        tracing::info!(
            bootstrap_servers = %config.bootstrap_servers,
            "kafka event bus configured"
        );

        Ok(Self {
            producer,
            config: Arc::new(config),
        })
    }

    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: OwnedHeaders,
    ) -> std::result::Result<(), String> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(headers);

        self.producer
            .send(record, self.config.message_timeout)
            .await
            .map(|_| ())
            .map_err(|(e, _)| e.to_string())
    }
}

#[async_trait]
impl EventBus for KafkaEventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        let topic = envelope.topic()?;
        let payload = serde_json::to_vec(&envelope)?;

        self.send(topic.as_str(), &envelope.key, &payload, attempt_headers(1))
            .await
            .map_err(|reason| EventBusError::PublishFailed { topic, reason })?;

        tracing::debug!(%topic, key = %envelope.key, "published to kafka");
        metrics::counter!("event_bus_published_total", "topic" => topic.as_str()).increment(1);
        Ok(())
    }

    async fn subscribe(&self, topic: Topic, group: &str) -> Result<Box<dyn Subscription>> {
        let failed = |reason: String| EventBusError::SubscriptionFailed {
            topic,
            group: group.to_string(),
            reason,
        };

        let consumer: StreamConsumer = self
            .config
            .consumer_config(group)
            .create()
            .map_err(|e| failed(e.to_string()))?;
        let retry_topic = KafkaEventBusConfig::retry_topic(group);
        consumer
            .subscribe(&[topic.as_str(), retry_topic.as_str()])
            .map_err(|e| failed(e.to_string()))?;

        tracing::info!(%topic, group, %retry_topic, "consumer group attached");

        Ok(Box::new(KafkaSubscription {
            topic,
            group: group.to_string(),
            consumer: Arc::new(consumer),
            offsets: Arc::new(Mutex::new(OffsetTracker::default())),
            bus: self.clone(),
        }))
    }
}

/// Where a message sits in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    topic: String,
    partition: i32,
    offset: i64,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    unsettled: BTreeSet<i64>,
    next: i64,
    committed: i64,
}

/// Tracks unsettled offsets per partition to find the commit watermark.
#[derive(Debug, Default)]
struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    fn track(&mut self, position: &Position) {
        let partition = self
            .partitions
            .entry((position.topic.clone(), position.partition))
            .or_default();
        partition.unsettled.insert(position.offset);
        partition.next = partition.next.max(position.offset + 1);
    }

    /// Settles `position` and returns the offset to commit when the
    /// watermark moved.
    fn settle(&mut self, position: &Position) -> Option<i64> {
        let partition = self
            .partitions
            .get_mut(&(position.topic.clone(), position.partition))?;
        partition.unsettled.remove(&position.offset);

        let watermark = partition
            .unsettled
            .first()
            .copied()
            .unwrap_or(partition.next);
        (watermark > partition.committed).then(|| {
            partition.committed = watermark;
            watermark
        })
    }
}

/// A message copied out of the consumer's buffer.
struct Received {
    position: Position,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    attempt: u32,
}

impl Received {
    fn copy<M: Message>(message: &M) -> Self {
        Self {
            position: Position {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            },
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            attempt: message.headers().and_then(attempt_from).unwrap_or(1),
        }
    }
}

struct KafkaSubscription {
    topic: Topic,
    group: String,
    consumer: Arc<StreamConsumer>,
    offsets: Arc<Mutex<OffsetTracker>>,
    bus: KafkaEventBus,
}

impl KafkaSubscription {
    fn acknowledger(&self, position: Position) -> KafkaAcknowledger {
        KafkaAcknowledger {
            topic: self.topic,
            group: self.group.clone(),
            position,
            consumer: self.consumer.clone(),
            offsets: self.offsets.clone(),
            bus: self.bus.clone(),
        }
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn recv(&mut self) -> Result<Option<Delivery>> {
        loop {
            let received = match self.consumer.recv().await {
                Ok(message) => Received::copy(&message),
                Err(e) => return Err(EventBusError::Broker(e.to_string())),
            };
            lock(&self.offsets).track(&received.position);
            let acker = self.acknowledger(received.position.clone());

            match serde_json::from_slice::<EventEnvelope>(&received.payload) {
                Ok(envelope) => {
                    return Ok(Some(Delivery::new(
                        envelope,
                        received.attempt,
                        Box::new(acker),
                    )));
                }
                Err(e) => {
                    tracing::error!(
                        topic = %received.position.topic,
                        partition = received.position.partition,
                        offset = received.position.offset,
                        error = %e,
                        "undecodable message forwarded to dead-letter topic"
                    );
                    acker.park_raw(&received, e.to_string()).await?;
                }
            }
        }
    }
}

struct KafkaAcknowledger {
    topic: Topic,
    group: String,
    position: Position,
    consumer: Arc<StreamConsumer>,
    offsets: Arc<Mutex<OffsetTracker>>,
    bus: KafkaEventBus,
}

impl KafkaAcknowledger {
    fn commit(&self) -> Result<()> {
        let Some(offset) = lock(&self.offsets).settle(&self.position) else {
            return Ok(());
        };

        let settlement = |e: rdkafka::error::KafkaError| {
            EventBusError::SettlementFailed(format!(
                "commit of {}[{}]@{offset} failed: {e}",
                self.position.topic, self.position.partition
            ))
        };
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            &self.position.topic,
            self.position.partition,
            Offset::Offset(offset),
        )
        .map_err(settlement)?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(settlement)
    }

    fn dead_letter_headers(&self, attempt: u32, reason: &str) -> OwnedHeaders {
        attempt_headers(attempt)
            .insert(Header {
                key: GROUP_HEADER,
                value: Some(self.group.as_str()),
            })
            .insert(Header {
                key: REASON_HEADER,
                value: Some(reason),
            })
    }

    async fn park_raw(self, received: &Received, reason: String) -> Result<()> {
        let dead_letter_topic = KafkaEventBusConfig::dead_letter_topic(&received.position.topic);
        let key = received.key.as_deref().unwrap_or_default();
        let headers = self.dead_letter_headers(received.attempt, &reason);

        let record = FutureRecord::to(&dead_letter_topic)
            .key(key)
            .payload(received.payload.as_slice())
            .headers(headers);
        self.bus
            .producer
            .send(record, self.bus.config.message_timeout)
            .await
            .map_err(|(e, _)| EventBusError::SettlementFailed(e.to_string()))?;

        metrics::counter!("event_bus_dead_letters_total", "topic" => self.topic.as_str())
            .increment(1);
        self.commit()
    }
}

#[async_trait]
impl Acknowledger for KafkaAcknowledger {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.commit()
    }

    async fn nack(self: Box<Self>, envelope: EventEnvelope, attempt: u32) -> Result<()> {
        let retry_topic = KafkaEventBusConfig::retry_topic(&self.group);
        let payload = serde_json::to_vec(&envelope)?;

        self.bus
            .send(&retry_topic, &envelope.key, &payload, attempt_headers(attempt + 1))
            .await
            .map_err(EventBusError::SettlementFailed)?;

        tracing::debug!(
            topic = %self.topic,
            group = %self.group,
            attempt,
            "message scheduled for redelivery"
        );
        self.commit()
    }

    async fn dead_letter(
        self: Box<Self>,
        envelope: EventEnvelope,
        attempt: u32,
        reason: String,
    ) -> Result<()> {
        let dead_letter_topic = KafkaEventBusConfig::dead_letter_topic(self.topic.as_str());
        let payload = serde_json::to_vec(&envelope)?;
        let headers = self.dead_letter_headers(attempt, &reason);

        self.bus
            .send(&dead_letter_topic, &envelope.key, &payload, headers)
            .await
            .map_err(EventBusError::SettlementFailed)?;

        tracing::warn!(
            topic = %self.topic,
            group = %self.group,
            attempt,
            reason = %reason,
            "message dead-lettered"
        );
        metrics::counter!("event_bus_dead_letters_total", "topic" => self.topic.as_str())
            .increment(1);
        self.commit()
    }

    fn abandon(self: Box<Self>, _envelope: EventEnvelope, attempt: u32) {
        tracing::debug!(
            topic = %self.position.topic,
            partition = self.position.partition,
            offset = self.position.offset,
            attempt,
            "delivery abandoned, offset left uncommitted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(partition: i32, offset: i64) -> Position {
        Position {
            topic: "orders.created".to_string(),
            partition,
            offset,
        }
    }

    #[test]
    fn test_producer_config() {
        let config = KafkaEventBusConfig::new("localhost:9092").producer_config();
        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("message.timeout.ms"), Some("5000"));
    }

    #[test]
    fn test_consumer_config_commits_manually() {
        let config = KafkaEventBusConfig::new("localhost:9092")
            .consumer_config("payment-service-orders.created");
        assert_eq!(config.get("group.id"), Some("payment-service-orders.created"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn test_sasl_config() {
        let config = KafkaEventBusConfig::new("localhost:9092")
            .with_sasl("user", "pass", "SCRAM-SHA-256")
            .consumer_config("g");
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-256"));
        assert_eq!(config.get("sasl.username"), Some("user"));
    }

    #[test]
    fn test_side_topic_names() {
        assert_eq!(
            KafkaEventBusConfig::retry_topic("stock-service-payment.succeeded"),
            "stock-service-payment.succeeded.retry"
        );
        assert_eq!(
            KafkaEventBusConfig::dead_letter_topic("orders.created"),
            "orders.created.dlq"
        );
    }

    #[test]
    fn test_attempt_header() {
        assert_eq!(attempt_from(&attempt_headers(3)), Some(3));
        assert_eq!(attempt_from(&OwnedHeaders::new()), None);

        let garbage = OwnedHeaders::new().insert(Header {
            key: ATTEMPT_HEADER,
            value: Some("many"),
        });
        assert_eq!(attempt_from(&garbage), None);
    }

    #[test]
    fn test_watermark_waits_for_earliest_unsettled() {
        let mut offsets = OffsetTracker::default();
        for offset in 10..13 {
            offsets.track(&position(0, offset));
        }

        assert_eq!(offsets.settle(&position(0, 11)), None);
        assert_eq!(offsets.settle(&position(0, 12)), None);
        assert_eq!(offsets.settle(&position(0, 10)), Some(13));
    }

    #[test]
    fn test_watermark_advances_in_order() {
        let mut offsets = OffsetTracker::default();
        offsets.track(&position(0, 0));
        offsets.track(&position(0, 1));

        assert_eq!(offsets.settle(&position(0, 0)), Some(1));
        assert_eq!(offsets.settle(&position(0, 1)), Some(2));
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut offsets = OffsetTracker::default();
        offsets.track(&position(0, 5));
        offsets.track(&position(1, 7));

        assert_eq!(offsets.settle(&position(1, 7)), Some(8));
        assert_eq!(offsets.settle(&position(0, 5)), Some(6));
    }

    #[test]
    fn test_abandoned_offset_holds_the_watermark() {
        let mut offsets = OffsetTracker::default();
        offsets.track(&position(0, 0));
        offsets.track(&position(0, 1));

        // Offset 0 is never settled.
        assert_eq!(offsets.settle(&position(0, 1)), None);
    }
}
