use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the FastMQ storage layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for segments and metadata
    pub data_dir: String,

    /// Maximum segment size in bytes before rolling over
    pub max_segment_size: u64,

    /// Maximum number of entries in a segment before rolling over
    pub max_segment_entries: u64,

    /// fsync every append before completing it
    pub sync_on_append: bool,

    /// Upper bound on messages returned by a single query
    pub max_query_messages: usize,

    /// Persist log descriptors under `<data_dir>/metadata`
    pub persist_metadata: bool,

    /// Execution pool used for blocking storage work
    pub pool: PoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            max_segment_size: 1024 * 1024 * 1024, // 1GB
            max_segment_entries: 1_000_000,
            sync_on_append: true,
            max_query_messages: 10_000,
            persist_metadata: true,
            pool: PoolConfig::default(),
        }
    }
}

impl Config {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the data directory
    pub fn with_data_dir(mut self, data_dir: impl Into<String>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Set the maximum segment size
    pub fn with_max_segment_size(mut self, bytes: u64) -> Self {
        self.max_segment_size = bytes;
        self
    }

    /// Set the maximum entries per segment
    pub fn with_max_segment_entries(mut self, entries: u64) -> Self {
        self.max_segment_entries = entries;
        self
    }

    /// Enable or disable fsync on every append
    pub fn with_sync_on_append(mut self, enabled: bool) -> Self {
        self.sync_on_append = enabled;
        self
    }

    /// Set the per-query message cap
    pub fn with_max_query_messages(mut self, max: usize) -> Self {
        self.max_query_messages = max;
        self
    }

    /// Enable or disable descriptor persistence
    pub fn with_persist_metadata(mut self, enabled: bool) -> Self {
        self.persist_metadata = enabled;
        self
    }

    /// Set the execution pool configuration
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Directory holding the segments of one topic
    pub fn topic_dir(&self, topic: &str) -> PathBuf {
        PathBuf::from(&self.data_dir).join(topic)
    }

    /// Directory holding persisted log descriptors
    pub fn metadata_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("metadata")
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.is_empty() {
            return Err(Error::InvalidConfig("data_dir must not be empty".into()));
        }
        if self.max_segment_size == 0 {
            return Err(Error::InvalidConfig(
                "max_segment_size must be greater than 0".into(),
            ));
        }
        if self.max_segment_entries == 0 {
            return Err(Error::InvalidConfig(
                "max_segment_entries must be greater than 0".into(),
            ));
        }
        if self.max_query_messages == 0 {
            return Err(Error::InvalidConfig(
                "max_query_messages must be greater than 0".into(),
            ));
        }
        self.pool.validate()
    }
}

/// Sizing of the [`ExecutionPool`](crate::pool::ExecutionPool)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Thread name prefix
    pub name: String,

    /// Workers kept alive for the lifetime of the pool
    pub core_threads: usize,

    /// Upper bound on workers, including burst workers
    pub max_threads: usize,

    /// Idle time after which a burst worker retires
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let core = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            name: "fastmq-storage".to_string(),
            core_threads: core,
            max_threads: core * 4,
            keep_alive: Duration::from_secs(120),
        }
    }
}

impl PoolConfig {
    /// One worker, no burst capacity. Tasks run strictly in submission order.
    pub fn single_threaded() -> Self {
        Self {
            core_threads: 1,
            max_threads: 1,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_core_threads(mut self, threads: usize) -> Self {
        self.core_threads = threads;
        self
    }

    pub fn with_max_threads(mut self, threads: usize) -> Self {
        self.max_threads = threads;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.core_threads == 0 {
            return Err(Error::InvalidConfig(
                "pool core_threads must be greater than 0".into(),
            ));
        }
        if self.max_threads < self.core_threads {
            return Err(Error::InvalidConfig(format!(
                "pool max_threads ({}) must be >= core_threads ({})",
                self.max_threads, self.core_threads
            )));
        }
        Ok(())
    }
}
