use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A single message as appended to a topic's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message is appended to
    pub topic: String,

    /// Producer that sent the message (connection-scoped id)
    pub producer_id: u64,

    /// Producer-assigned sequence id, echoed back in the receipt
    pub sequence_id: u64,

    /// Opaque payload
    pub payload: Bytes,

    /// Creation time in milliseconds since epoch
    pub publish_time: i64,

    /// Optional application properties
    pub properties: Vec<(String, String)>,
}

impl Message {
    /// Create a new message
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            producer_id: 0,
            sequence_id: 0,
            payload: payload.into(),
            publish_time: Utc::now().timestamp_millis(),
            properties: Vec::new(),
        }
    }

    /// Stamp the message with the producer identity it was sent under
    pub fn with_producer(mut self, producer_id: u64, sequence_id: u64) -> Self {
        self.producer_id = producer_id;
        self.sequence_id = sequence_id;
        self
    }

    /// Add a property to the message
    pub fn add_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
