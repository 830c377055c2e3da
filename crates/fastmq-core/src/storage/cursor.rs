use super::MessageStorage;
use crate::{Message, Offset, Result};
use std::sync::Arc;

/// Restartable reader over a [`MessageStorage`].
///
/// Each [`read_entries`](Self::read_entries) call continues where the last
/// one stopped. Persisting [`position`](Self::position) and creating a new
/// cursor at it later resumes the same iteration.
pub struct LogCursor<S: MessageStorage + ?Sized> {
    storage: Arc<S>,
    position: Offset,
}

impl<S: MessageStorage + ?Sized> LogCursor<S> {
    pub fn new(storage: Arc<S>, position: Offset) -> Self {
        Self { storage, position }
    }

    /// Cursor at the first entry of the log
    pub fn from_earliest(storage: Arc<S>) -> Self {
        Self::new(storage, Offset::EARLIEST)
    }

    /// Read up to `max` entries. An empty batch means the cursor is caught up;
    /// the position is then left unchanged.
    pub async fn read_entries(&mut self, max: usize) -> Result<Vec<(Offset, Message)>> {
        let result = self.storage.query_message(self.position, max).await?;
        self.position = result.next_offset;
        Ok(result.entries)
    }

    /// Offset the next read starts at
    pub fn position(&self) -> Offset {
        self.position
    }

    pub fn seek(&mut self, offset: Offset) {
        self.position = offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::ExecutionPool;
    use crate::storage::{LogStorage, MetadataRegistry};
    use crate::{Config, Error};
    use tempfile::TempDir;

    async fn log_with_entries(dir: &TempDir, count: usize) -> Arc<LogStorage> {
        let config = Config::new()
            .with_data_dir(dir.path().to_string_lossy().to_string())
            .with_sync_on_append(false)
            .with_max_segment_entries(4)
            .with_pool(PoolConfig::single_threaded());
        let pool = ExecutionPool::new(config.pool.clone()).unwrap();
        let log = LogStorage::open(
            "events",
            config,
            pool,
            Arc::new(MetadataRegistry::in_memory()),
        )
        .await
        .unwrap();
        for i in 0..count {
            log.append_message(Message::new("events", format!("e{}", i)))
                .await
                .unwrap();
        }
        Arc::new(log)
    }

    #[tokio::test]
    async fn test_cursor_reads_whole_log_in_batches() {
        let dir = TempDir::new().unwrap();
        let log = log_with_entries(&dir, 10).await;
        let mut cursor = LogCursor::from_earliest(log);

        let mut payloads = Vec::new();
        loop {
            let batch = cursor.read_entries(3).await.unwrap();
            if batch.is_empty() {
                break;
            }
            payloads.extend(batch.into_iter().map(|(_, m)| m.payload));
        }

        assert_eq!(payloads.len(), 10);
        assert_eq!(payloads[9], bytes::Bytes::from("e9"));
        assert_eq!(cursor.position(), Offset::new(2, 2));
    }

    #[tokio::test]
    async fn test_cursor_restarts_from_saved_position() {
        let dir = TempDir::new().unwrap();
        let log = log_with_entries(&dir, 6).await;

        let mut first = LogCursor::from_earliest(Arc::clone(&log));
        first.read_entries(5).await.unwrap();
        let saved = first.position();
        assert_eq!(saved, Offset::new(1, 1));

        let mut second = LogCursor::new(Arc::clone(&log), saved);
        let batch = second.read_entries(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0, Offset::new(1, 1));

        // Caught up; new data shows up on the next read
        assert!(second.read_entries(10).await.unwrap().is_empty());
        log.append_message(Message::new("events", "late"))
            .await
            .unwrap();
        assert_eq!(second.read_entries(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_surfaces_missing_segment() {
        let dir = TempDir::new().unwrap();
        let log = log_with_entries(&dir, 2).await;
        let mut cursor = LogCursor::new(log, Offset::new(-3, 0));
        assert!(matches!(
            cursor.read_entries(1).await,
            Err(Error::SegmentNotFound { .. })
        ));
        cursor.seek(Offset::EARLIEST);
        assert_eq!(cursor.read_entries(10).await.unwrap().len(), 2);
    }
}
