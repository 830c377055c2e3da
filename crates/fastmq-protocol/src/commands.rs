use crate::{ProtocolError, Result, MAX_MESSAGE_SIZE};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Durable position of a message: `(segment_id, entry_id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIdData {
    pub segment_id: i64,
    pub entry_id: i64,
}

impl MessageIdData {
    pub const fn new(segment_id: i64, entry_id: i64) -> Self {
        Self {
            segment_id,
            entry_id,
        }
    }
}

impl fmt::Display for MessageIdData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.entry_id)
    }
}

/// Error codes reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerError {
    UnknownError,
    /// The append could not be made durable
    PersistenceError,
    ProducerNotFound,
    ProducerAlreadyExists,
    TopicNotFound,
    InvalidTopicName,
    ServiceNotReady,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerError::UnknownError => "unknown error",
            ServerError::PersistenceError => "persistence error",
            ServerError::ProducerNotFound => "producer not found",
            ServerError::ProducerAlreadyExists => "producer already exists",
            ServerError::TopicNotFound => "topic not found",
            ServerError::InvalidTopicName => "invalid topic name",
            ServerError::ServiceNotReady => "service not ready",
        };
        f.write_str(name)
    }
}

/// Register a producer on this connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandProducer {
    pub producer_id: u64,
    pub request_id: u64,
    pub producer_name: String,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandProducerSuccess {
    pub request_id: u64,
    pub producer_name: String,
}

/// Publish one message under a registered producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSend {
    pub producer_id: u64,
    pub sequence_id: u64,
    pub payload: Bytes,
    /// Milliseconds since epoch
    pub publish_time: i64,
    pub properties: Vec<(String, String)>,
}

/// Durable acknowledgment of one send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSendReceipt {
    pub producer_id: u64,
    pub sequence_id: u64,
    pub message_id: Option<MessageIdData>,
}

/// The broker failed to persist one send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSendError {
    pub producer_id: u64,
    pub sequence_id: u64,
    pub error: ServerError,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandCloseProducer {
    pub producer_id: u64,
    pub request_id: u64,
}

/// Failure of a request that is not a send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    pub request_id: u64,
    pub error: ServerError,
    pub message: String,
}

/// Every command that crosses a connection.
///
/// Variant order is part of the encoding; append new variants at the end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseCommand {
    Producer(CommandProducer),
    ProducerSuccess(CommandProducerSuccess),
    Send(CommandSend),
    SendReceipt(CommandSendReceipt),
    SendError(CommandSendError),
    CloseProducer(CommandCloseProducer),
    Error(CommandError),
}

impl BaseCommand {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            BaseCommand::Producer(_) => "PRODUCER",
            BaseCommand::ProducerSuccess(_) => "PRODUCER_SUCCESS",
            BaseCommand::Send(_) => "SEND",
            BaseCommand::SendReceipt(_) => "SEND_RECEIPT",
            BaseCommand::SendError(_) => "SEND_ERROR",
            BaseCommand::CloseProducer(_) => "CLOSE_PRODUCER",
            BaseCommand::Error(_) => "ERROR",
        }
    }

    /// Serialize command to bytes (bincode format)
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::CommandTooLarge`] if the encoded command
    /// exceeds [`MAX_MESSAGE_SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes =
            bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::CommandTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Deserialize command from bytes (bincode format)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::CommandTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        bincode::deserialize(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}
