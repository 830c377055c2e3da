//! Storage metrics for FastMQ
//!
//! Uses the `metrics` crate facade; whichever recorder the embedding process
//! installs receives the values. Without a recorder every call is a no-op.
//!
//! All metrics follow the pattern: `fastmq_{component}_{name}_{unit}`

use std::time::{Duration, Instant};

/// Storage engine metrics
pub struct StorageMetrics;

impl StorageMetrics {
    // ---- Counters ----

    /// Total messages appended
    pub fn increment_messages_appended(topic: &str) {
        metrics::counter!("fastmq_storage_messages_appended_total", "topic" => topic.to_string())
            .increment(1);
    }

    /// Total messages returned by queries
    pub fn add_messages_read(topic: &str, count: u64) {
        metrics::counter!("fastmq_storage_messages_read_total", "topic" => topic.to_string())
            .increment(count);
    }

    /// Segment rollovers
    pub fn increment_segment_rollovers(topic: &str) {
        metrics::counter!("fastmq_storage_segment_rollovers_total", "topic" => topic.to_string())
            .increment(1);
    }

    /// Tasks that panicked inside the execution pool
    pub fn increment_pool_task_failures(pool: &str) {
        metrics::counter!("fastmq_pool_task_failures_total", "pool" => pool.to_string())
            .increment(1);
    }

    // ---- Gauges ----

    /// Active segment id per topic
    pub fn set_active_segment(topic: &str, segment_id: i64) {
        metrics::gauge!("fastmq_storage_active_segment", "topic" => topic.to_string())
            .set(segment_id as f64);
    }

    /// Live worker threads in the execution pool
    pub fn set_pool_threads(pool: &str, threads: usize) {
        metrics::gauge!("fastmq_pool_threads", "pool" => pool.to_string()).set(threads as f64);
    }

    // ---- Histograms ----

    /// Record append latency in microseconds
    pub fn record_append_latency_us(us: u64) {
        metrics::histogram!("fastmq_storage_append_latency_seconds")
            .record(us as f64 / 1_000_000.0);
    }

    /// Record query latency in microseconds
    pub fn record_read_latency_us(us: u64) {
        metrics::histogram!("fastmq_storage_read_latency_seconds")
            .record(us as f64 / 1_000_000.0);
    }
}

/// Timer for measuring operation durations
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Create a new timer starting now
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in microseconds
    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Get elapsed Duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
