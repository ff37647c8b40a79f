use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EventBusError, Result, Topic};

/// Schema version stamped on every envelope published by this crate.
pub const SCHEMA_VERSION: &str = "1.0";

/// Namespace for deterministic event ids.
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d0e_8a4b_4e3c_9b7d_5a1e_c0f2_7d31);

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derives the event ID of the fact `topic` about the entity `key`.
    ///
    /// Publishing the same fact twice yields the same id, which lets
    /// consumers drop the duplicate.
    pub fn for_topic(key: &str, topic: Topic) -> Self {
        let name = format!("{}/{key}", topic.as_str());
        Self(Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes()))
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// An envelope wrapping every fact published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event, used for deduplication.
    pub event_id: EventId,

    /// The topic name (e.g., "orders.created").
    pub event_type: String,

    /// Partition key. All events about one order share it.
    pub key: String,

    /// When the event was published.
    pub timestamp: DateTime<Utc>,

    /// Version of the payload schema.
    pub schema_version: String,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Additional annotations (e.g., `failure_reason`).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Returns the topic this envelope was published to.
    pub fn topic(&self) -> Result<Topic> {
        self.event_type.parse()
    }

    /// Deserializes the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Returns a string metadata entry.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    topic: Option<Topic>,
    key: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, it is derived from the topic and key.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the topic.
    pub fn topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Sets the partition key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds the event envelope.
    pub fn build(self) -> Result<EventEnvelope> {
        let topic = self.topic.ok_or(EventBusError::IncompleteEnvelope("topic"))?;
        let key = self.key.ok_or(EventBusError::IncompleteEnvelope("key"))?;
        let payload = self
            .payload
            .ok_or(EventBusError::IncompleteEnvelope("payload"))?;

        Ok(EventEnvelope {
            event_id: self
                .event_id
                .unwrap_or_else(|| EventId::for_topic(&key, topic)),
            event_type: topic.as_str().to_string(),
            key,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            schema_version: SCHEMA_VERSION.to_string(),
            payload,
            metadata: self.metadata,
        })
    }
}
