pub mod cursor;
pub mod log;
pub mod manager;
pub mod metadata;
pub mod segment;

pub use cursor::LogCursor;
pub use log::LogStorage;
pub use manager::StorageManager;
pub use metadata::{LogDescriptor, MetadataRegistry, MetadataStorage, SegmentInfo, SegmentState};
pub use segment::Segment;

use crate::{Message, Offset, Result};
use async_trait::async_trait;

/// Result of a query: entries in increasing offset order plus the offset to
/// continue from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMessageResult {
    pub entries: Vec<(Offset, Message)>,
    pub next_offset: Offset,
}

impl GetMessageResult {
    /// No entries; resume where the query started
    pub fn empty(offset: Offset) -> Self {
        Self {
            entries: Vec::new(),
            next_offset: offset,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Append-only, offset-addressed message storage of one topic
#[async_trait]
pub trait MessageStorage: Send + Sync {
    /// Durably append `message` and return the offset it was written at
    async fn append_message(&self, message: Message) -> Result<Offset>;

    /// Read up to `max_count` messages starting at `offset` (inclusive).
    ///
    /// Reading at or past the end yields an empty result whose
    /// `next_offset` equals `offset`. Addressing a segment that does not
    /// exist fails with `SegmentNotFound`.
    async fn query_message(&self, offset: Offset, max_count: usize) -> Result<GetMessageResult>;

    /// Flush and release resources. Every later call fails fast.
    async fn close(&self) -> Result<()>;
}
