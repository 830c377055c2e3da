//! # fastmq-core
//!
//! Durability core of the FastMQ broker.
//!
//! - [`Offset`]: `(segment_id, entry_id)` address of one durable message
//! - [`storage::LogStorage`]: append-only, segmented log of one topic
//! - [`storage::MetadataRegistry`]: per-topic log descriptors with per-topic
//!   mutual exclusion
//! - [`storage::StorageManager`]: lazily opened logs behind one pool and registry
//! - [`ExecutionPool`]: bounded worker pool that keeps file I/O off async tasks
//!
//! ```rust,ignore
//! use fastmq_core::{Config, Message, Offset, StorageManager};
//!
//! let storage = StorageManager::new(Config::default()).await?;
//! let offset = storage.append_message(Message::new("orders", "hello")).await?;
//! let result = storage.query_message("orders", offset, 10).await?;
//! assert_eq!(result.entries[0].0, offset);
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod offset;
pub mod pool;
pub mod storage;
pub mod validation;

pub use config::{Config, PoolConfig};
pub use error::{Error, Result};
pub use message::Message;
pub use offset::Offset;
pub use pool::{ExecutionPool, PoolStatsSnapshot, TaskFailure, TaskFailureObserver};
pub use storage::{
    GetMessageResult, LogCursor, LogDescriptor, LogStorage, MessageStorage, MetadataRegistry,
    MetadataStorage, SegmentInfo, SegmentState, StorageManager,
};
