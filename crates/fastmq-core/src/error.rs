use crate::offset::Offset;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Segment {segment_id} not found for topic {topic}")]
    SegmentNotFound { topic: String, segment_id: i64 },

    #[error("Segment {segment_id} of topic {topic} already holds data")]
    SegmentExists { topic: String, segment_id: i64 },

    #[error("Invalid offset: {0}")]
    InvalidOffset(Offset),

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Message for topic {actual} appended to log of topic {expected}")]
    TopicMismatch { expected: String, actual: String },

    #[error("Storage closed: {0}")]
    StorageClosed(String),

    #[error("Version conflict on {topic}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        topic: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Corrupted segment {segment_id} at position {position}: {reason}")]
    Corrupted {
        segment_id: i64,
        position: u64,
        reason: String,
    },

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Execution pool is shut down")]
    PoolShutdown,

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error means the addressed topic or segment does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::TopicNotFound(_) | Error::SegmentNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
