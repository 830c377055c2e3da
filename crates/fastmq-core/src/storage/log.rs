use super::metadata::{LogDescriptor, MetadataStorage};
use super::segment::{list_segment_ids, segment_path, Segment};
use super::{GetMessageResult, MessageStorage};
use crate::metrics::{StorageMetrics, Timer};
use crate::pool::ExecutionPool;
use crate::validation::validate_topic_name;
use crate::{Config, Error, Message, Offset, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Append-only log of a single topic.
///
/// Appends are serialized per topic; the active segment and the descriptor in
/// the metadata registry change together under that same lock, so an append
/// never targets a segment the registry no longer considers active. All file
/// I/O runs on the [`ExecutionPool`].
pub struct LogStorage {
    topic: String,
    dir: PathBuf,
    config: Config,
    pool: ExecutionPool,
    metadata: Arc<dyn MetadataStorage>,
    append_lock: Mutex<()>,
    state: RwLock<LogState>,
    closed: AtomicBool,
}

#[derive(Default)]
struct LogState {
    /// `None` until the first append creates the log
    descriptor: Option<LogDescriptor>,
    segments: BTreeMap<i64, Arc<Segment>>,
}

impl LogState {
    fn active(&self) -> Option<Arc<Segment>> {
        self.segments.values().next_back().cloned()
    }
}

impl LogStorage {
    /// Open the log of `topic`, reloading its segments if the registry
    /// already knows the topic.
    ///
    /// Segment files without a descriptor (metadata kept in memory across a
    /// restart, or a lost descriptor file) are registered again instead of
    /// being overwritten by a fresh log.
    pub async fn open(
        topic: &str,
        config: Config,
        pool: ExecutionPool,
        metadata: Arc<dyn MetadataStorage>,
    ) -> Result<Self> {
        validate_topic_name(topic)?;
        let dir = config.topic_dir(topic);

        let mut state = LogState::default();
        let descriptor = match metadata.get_log_info(topic).await {
            Ok(descriptor) => Some(descriptor),
            Err(Error::TopicNotFound(_)) => {
                recover_descriptor(topic, &dir, &pool, metadata.as_ref()).await?
            }
            Err(e) => return Err(e),
        };

        match descriptor {
            Some(descriptor) => {
                let infos: Vec<(i64, bool)> = descriptor
                    .segments
                    .iter()
                    .map(|info| (info.segment_id, info.is_sealed()))
                    .collect();
                let load_dir = dir.clone();
                let load_topic = topic.to_string();
                state.segments = pool
                    .run(move || load_segments(&load_dir, &load_topic, &infos))
                    .await??;
                info!(
                    "Opened log {} with {} segments (descriptor version {})",
                    topic,
                    state.segments.len(),
                    descriptor.version
                );
                state.descriptor = Some(descriptor);
            }
            None => debug!("Log {} has no descriptor yet", topic),
        }

        if let Some(active) = state.active() {
            StorageMetrics::set_active_segment(topic, active.segment_id());
        }

        Ok(Self {
            topic: topic.to_string(),
            dir,
            config,
            pool,
            metadata,
            append_lock: Mutex::new(()),
            state: RwLock::new(state),
            closed: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the current descriptor, `None` before the first append
    pub async fn descriptor(&self) -> Option<LogDescriptor> {
        self.state.read().await.descriptor.clone()
    }

    /// Offset of the last written entry
    pub async fn last_offset(&self) -> Option<Offset> {
        let state = self.state.read().await;
        let descriptor = state.descriptor.as_ref()?;
        match state.active() {
            Some(active) if active.entry_count() > 0 => Some(Offset::new(
                active.segment_id(),
                active.entry_count() as i64 - 1,
            )),
            _ => descriptor.last_offset(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StorageClosed(self.topic.clone()));
        }
        Ok(())
    }

    /// Segment the next append goes to, creating the log or rolling over
    /// when needed. Caller holds `append_lock`.
    async fn writable_segment(&self) -> Result<Arc<Segment>> {
        let active = {
            let state = self.state.read().await;
            if state.descriptor.is_some() {
                state.active()
            } else {
                None
            }
        };

        match active {
            None => self.create_log().await,
            Some(active)
                if active.is_full(
                    self.config.max_segment_size,
                    self.config.max_segment_entries,
                ) =>
            {
                self.roll_over(active).await
            }
            Some(active) => Ok(active),
        }
    }

    async fn create_log(&self) -> Result<Arc<Segment>> {
        let segment = self.create_segment(0).await?;
        let descriptor = LogDescriptor::new(&self.topic);

        if let Err(e) = self
            .metadata
            .compare_and_update_log_info(&self.topic, None, descriptor.clone())
            .await
        {
            warn!("Failed to register log {}: {}", self.topic, e);
            self.discard_segment(segment).await;
            return Err(e);
        }

        let mut state = self.state.write().await;
        state.descriptor = Some(descriptor);
        state.segments.insert(0, Arc::clone(&segment));
        StorageMetrics::set_active_segment(&self.topic, 0);
        info!("Created log {}", self.topic);
        Ok(segment)
    }

    /// Create the next segment, record it in the registry, then seal the old
    /// one. If the registry rejects the update the new file is removed and the
    /// old segment stays active.
    async fn roll_over(&self, active: Arc<Segment>) -> Result<Arc<Segment>> {
        let old_id = active.segment_id();
        let next_id = old_id + 1;
        let segment = self.create_segment(next_id).await?;

        let mut descriptor = match self.state.read().await.descriptor.clone() {
            Some(descriptor) => descriptor,
            None => return Err(Error::TopicNotFound(self.topic.clone())),
        };
        let expected = descriptor.version;
        descriptor.roll_to(next_id, active.entry_count());

        if let Err(e) = self
            .metadata
            .compare_and_update_log_info(&self.topic, Some(expected), descriptor.clone())
            .await
        {
            warn!(
                "Rollover of {} to segment {} rejected by registry: {}",
                self.topic, next_id, e
            );
            self.discard_segment(segment).await;
            return Err(e);
        }

        {
            let mut state = self.state.write().await;
            state.descriptor = Some(descriptor);
            state.segments.insert(next_id, Arc::clone(&segment));
        }

        StorageMetrics::increment_segment_rollovers(&self.topic);
        StorageMetrics::set_active_segment(&self.topic, next_id);
        info!(
            "Rolled log {} from segment {} to {}",
            self.topic, old_id, next_id
        );

        let sealing = Arc::clone(&active);
        self.pool.run(move || sealing.seal()).await??;
        Ok(segment)
    }

    async fn create_segment(&self, segment_id: i64) -> Result<Arc<Segment>> {
        let dir = self.dir.clone();
        let topic = self.topic.clone();
        let segment = self
            .pool
            .run(move || Segment::create(&dir, &topic, segment_id))
            .await??;
        Ok(Arc::new(segment))
    }

    async fn discard_segment(&self, segment: Arc<Segment>) {
        let path = segment.path().to_path_buf();
        drop(segment);
        match self.pool.run(move || std::fs::remove_file(path)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to remove discarded segment of {}: {}", self.topic, e),
            Err(e) => warn!("Failed to remove discarded segment of {}: {}", self.topic, e),
        }
    }

    /// Close the log, remove its descriptor and delete its files
    pub async fn delete(&self) -> Result<()> {
        self.close().await?;
        self.metadata.remove_log_info(&self.topic).await?;

        let dir = self.dir.clone();
        self.pool
            .run(move || match std::fs::remove_dir_all(&dir) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            })
            .await??;
        info!("Deleted log {}", self.topic);
        Ok(())
    }
}

/// Register a descriptor for segment files found on disk. `None` if the
/// topic directory holds no segments.
async fn recover_descriptor(
    topic: &str,
    dir: &std::path::Path,
    pool: &ExecutionPool,
    metadata: &dyn MetadataStorage,
) -> Result<Option<LogDescriptor>> {
    let scan_dir = dir.to_path_buf();
    let scan_topic = topic.to_string();
    let found = pool
        .run(move || scan_segments(&scan_dir, &scan_topic))
        .await??;
    if found.is_empty() {
        return Ok(None);
    }

    let descriptor = LogDescriptor::recovered(topic, &found);
    match metadata
        .compare_and_update_log_info(topic, None, descriptor.clone())
        .await
    {
        Ok(()) => {
            warn!(
                "Recovered descriptor of {} from {} segment files",
                topic,
                found.len()
            );
            Ok(Some(descriptor))
        }
        // Registered by a concurrent open
        Err(Error::VersionConflict { .. }) => metadata.get_log_info(topic).await.map(Some),
        Err(e) => Err(e),
    }
}

/// `(segment_id, entry_count)` of every segment file in `dir`
fn scan_segments(dir: &std::path::Path, topic: &str) -> Result<Vec<(i64, u64)>> {
    list_segment_ids(dir)?
        .into_iter()
        .map(|segment_id| {
            let segment = Segment::open(dir, topic, segment_id, true)?;
            Ok((segment_id, segment.entry_count()))
        })
        .collect()
}

fn load_segments(
    dir: &std::path::Path,
    topic: &str,
    infos: &[(i64, bool)],
) -> Result<BTreeMap<i64, Arc<Segment>>> {
    let mut segments = BTreeMap::new();
    let last = infos.len().saturating_sub(1);

    for (idx, &(segment_id, sealed)) in infos.iter().enumerate() {
        let is_active = idx == last && !sealed;
        let segment = if is_active && !segment_path(dir, segment_id).exists() {
            warn!(
                "Active segment {} of {} is missing, recreating it",
                segment_id, topic
            );
            Segment::create(dir, topic, segment_id)?
        } else {
            match Segment::open(dir, topic, segment_id, !is_active) {
                Ok(segment) => segment,
                Err(Error::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("Segment {} of {} is missing on disk", segment_id, topic);
                    continue;
                }
                Err(e) => return Err(e),
            }
        };
        segments.insert(segment_id, Arc::new(segment));
    }

    Ok(segments)
}

/// Read forward from `start` through `segments`, the descriptor's segments
/// from `start.segment_id` on. `None` marks a segment missing on disk: the
/// read stops there, and fails if it has nothing to return yet.
fn read_across(
    topic: &str,
    segments: &[(i64, Option<Arc<Segment>>)],
    start: Offset,
    max: usize,
) -> Result<Vec<(Offset, Message)>> {
    let mut entries = Vec::new();
    for (segment_id, segment) in segments {
        let segment = match segment {
            Some(segment) => segment,
            None if entries.is_empty() => {
                return Err(Error::SegmentNotFound {
                    topic: topic.to_string(),
                    segment_id: *segment_id,
                })
            }
            None => break,
        };
        let from = if segment.segment_id() == start.segment_id {
            start.entry_id
        } else {
            0
        };
        let batch = segment.read(from, max - entries.len())?;
        entries.extend(batch);

        // Only a sealed segment is followed by more data
        if entries.len() >= max || !segment.is_sealed() {
            break;
        }
    }
    Ok(entries)
}

#[async_trait]
impl MessageStorage for LogStorage {
    async fn append_message(&self, message: Message) -> Result<Offset> {
        self.ensure_open()?;
        if message.topic != self.topic {
            return Err(Error::TopicMismatch {
                expected: self.topic.clone(),
                actual: message.topic,
            });
        }

        let timer = Timer::new();
        let _guard = self.append_lock.lock().await;
        // Closed while waiting for the lock
        self.ensure_open()?;

        let segment = self.writable_segment().await?;
        let segment_id = segment.segment_id();
        let sync = self.config.sync_on_append;
        let entry_id = self
            .pool
            .run(move || segment.append(&message, sync))
            .await??;

        let offset = Offset::new(segment_id, entry_id);
        StorageMetrics::increment_messages_appended(&self.topic);
        StorageMetrics::record_append_latency_us(timer.elapsed_us());
        debug!("Appended to {} at {}", self.topic, offset);
        Ok(offset)
    }

    async fn query_message(&self, offset: Offset, max_count: usize) -> Result<GetMessageResult> {
        self.ensure_open()?;
        if offset.entry_id < 0 {
            return Err(Error::InvalidOffset(offset));
        }
        if max_count == 0 {
            return Ok(GetMessageResult::empty(offset));
        }
        let max = max_count.min(self.config.max_query_messages);
        let timer = Timer::new();

        let segments: Vec<(i64, Option<Arc<Segment>>)> = {
            let state = self.state.read().await;
            let descriptor = match &state.descriptor {
                Some(descriptor) => descriptor,
                None => return Ok(GetMessageResult::empty(offset)),
            };
            let active_id = descriptor
                .segments
                .last()
                .map(|info| info.segment_id)
                .unwrap_or_default();
            if offset.segment_id > active_id {
                return Ok(GetMessageResult::empty(offset));
            }
            if descriptor.find_segment(offset.segment_id).is_none()
                || !state.segments.contains_key(&offset.segment_id)
            {
                return Err(Error::SegmentNotFound {
                    topic: self.topic.clone(),
                    segment_id: offset.segment_id,
                });
            }
            descriptor
                .segments
                .iter()
                .filter(|info| info.segment_id >= offset.segment_id)
                .map(|info| (info.segment_id, state.segments.get(&info.segment_id).cloned()))
                .collect()
        };

        let topic = self.topic.clone();
        let entries = self
            .pool
            .run(move || read_across(&topic, &segments, offset, max))
            .await??;

        let next_offset = entries
            .last()
            .map(|(last, _)| last.next_entry())
            .unwrap_or(offset);

        StorageMetrics::add_messages_read(&self.topic, entries.len() as u64);
        StorageMetrics::record_read_latency_us(timer.elapsed_us());
        Ok(GetMessageResult {
            entries,
            next_offset,
        })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Wait for an in-flight append to finish
        let _guard = self.append_lock.lock().await;

        let segments: Vec<Arc<Segment>> = {
            let mut state = self.state.write().await;
            std::mem::take(&mut state.segments).into_values().collect()
        };

        let result = self
            .pool
            .run(move || -> Result<()> {
                for segment in &segments {
                    segment.sync()?;
                }
                Ok(())
            })
            .await;

        match result {
            Ok(Ok(())) => {
                info!("Closed log {}", self.topic);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::Interrupted(format!(
                "closing log {}: {}",
                self.topic, e
            ))),
        }
    }
}

impl std::fmt::Debug for LogStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStorage")
            .field("topic", &self.topic)
            .field("dir", &self.dir)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::storage::metadata::MetadataRegistry;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config::new()
            .with_data_dir(dir.path().to_string_lossy().to_string())
            .with_sync_on_append(false)
            .with_pool(PoolConfig::single_threaded())
    }

    async fn open_log(config: Config, metadata: Arc<dyn MetadataStorage>) -> LogStorage {
        let pool = ExecutionPool::new(config.pool.clone()).unwrap();
        LogStorage::open("orders", config, pool, metadata)
            .await
            .unwrap()
    }

    fn message(i: usize) -> Message {
        Message::new("orders", format!("order-{}", i)).with_producer(1, i as u64)
    }

    #[tokio::test]
    async fn test_entry_ids_start_at_zero_and_are_gapless() {
        let dir = TempDir::new().unwrap();
        let log = open_log(test_config(&dir), Arc::new(MetadataRegistry::in_memory())).await;

        for i in 0..20 {
            let offset = log.append_message(message(i)).await.unwrap();
            assert_eq!(offset, Offset::new(0, i as i64));
        }
        assert_eq!(log.last_offset().await, Some(Offset::new(0, 19)));
    }

    #[tokio::test]
    async fn test_append_then_query_returns_message() {
        let dir = TempDir::new().unwrap();
        let log = open_log(test_config(&dir), Arc::new(MetadataRegistry::in_memory())).await;

        let msg = message(1).add_property("k", "v");
        let offset = log.append_message(msg.clone()).await.unwrap();
        let result = log.query_message(offset, 1).await.unwrap();

        assert_eq!(result.entries, vec![(offset, msg)]);
        assert_eq!(result.next_offset, offset.next_entry());
    }

    #[tokio::test]
    async fn test_query_past_end_is_empty_not_error() {
        let dir = TempDir::new().unwrap();
        let log = open_log(test_config(&dir), Arc::new(MetadataRegistry::in_memory())).await;

        // Nothing written yet
        let result = log.query_message(Offset::EARLIEST, 10).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.next_offset, Offset::EARLIEST);

        for i in 0..3 {
            log.append_message(message(i)).await.unwrap();
        }

        for beyond in [Offset::new(0, 3), Offset::new(0, 100), Offset::new(5, 0)] {
            let result = log.query_message(beyond, 10).await.unwrap();
            assert!(result.is_empty());
            assert_eq!(result.next_offset, beyond);
        }
    }

    #[tokio::test]
    async fn test_query_edge_cases() {
        let dir = TempDir::new().unwrap();
        let log = open_log(test_config(&dir), Arc::new(MetadataRegistry::in_memory())).await;
        log.append_message(message(0)).await.unwrap();

        let result = log.query_message(Offset::EARLIEST, 0).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.next_offset, Offset::EARLIEST);

        assert!(matches!(
            log.query_message(Offset::new(0, -1), 1).await,
            Err(Error::InvalidOffset(_))
        ));
        assert!(matches!(
            log.query_message(Offset::new(-1, 0), 1).await,
            Err(Error::SegmentNotFound { segment_id: -1, .. })
        ));
    }

    #[tokio::test]
    async fn test_rollover_on_entry_limit_and_query_across_segments() {
        let dir = TempDir::new().unwrap();
        let metadata: Arc<dyn MetadataStorage> = Arc::new(MetadataRegistry::in_memory());
        let config = test_config(&dir).with_max_segment_entries(4);
        let log = open_log(config, Arc::clone(&metadata)).await;

        let appended: Vec<Message> = (0..10).map(message).collect();
        let mut offsets = Vec::new();
        for msg in &appended {
            offsets.push(log.append_message(msg.clone()).await.unwrap());
        }

        assert_eq!(offsets[3], Offset::new(0, 3));
        assert_eq!(offsets[4], Offset::new(1, 0));
        assert_eq!(offsets[9], Offset::new(2, 1));
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));

        let descriptor = metadata.get_log_info("orders").await.unwrap();
        assert_eq!(descriptor.version, 2);
        assert_eq!(descriptor.segments.len(), 3);
        assert!(descriptor.segments[0].is_sealed());
        assert_eq!(descriptor.segments[0].entry_count, 4);
        assert_eq!(descriptor.active_segment().unwrap().segment_id, 2);

        // One query walks through both sealed segments into the active one
        let result = log.query_message(Offset::new(0, 2), 100).await.unwrap();
        let got: Vec<Offset> = result.entries.iter().map(|(o, _)| *o).collect();
        assert_eq!(got, offsets[2..].to_vec());
        assert_eq!(result.next_offset, Offset::new(2, 2));
        assert_eq!(result.entries[0].1, appended[2]);
    }

    #[tokio::test]
    async fn test_resume_offset_walks_the_log() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_max_segment_entries(3);
        let log = open_log(config, Arc::new(MetadataRegistry::in_memory())).await;
        for i in 0..7 {
            log.append_message(message(i)).await.unwrap();
        }

        let mut position = Offset::EARLIEST;
        let mut seen = Vec::new();
        loop {
            let result = log.query_message(position, 2).await.unwrap();
            if result.is_empty() {
                break;
            }
            seen.extend(result.entries.into_iter().map(|(_, m)| m.sequence_id));
            position = result.next_offset;
        }
        assert_eq!(seen, (0..7).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_rollover_on_size_limit() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_max_segment_size(1);
        let log = open_log(config, Arc::new(MetadataRegistry::in_memory())).await;

        // Every segment fills up with its first entry
        for i in 0..3 {
            let offset = log.append_message(message(i)).await.unwrap();
            assert_eq!(offset, Offset::new(i as i64, 0));
        }
    }

    #[tokio::test]
    async fn test_failed_rollover_keeps_old_segment_active() {
        let dir = TempDir::new().unwrap();
        let metadata: Arc<dyn MetadataStorage> = Arc::new(MetadataRegistry::in_memory());
        let config = test_config(&dir).with_max_segment_entries(2);
        let log = open_log(config, Arc::clone(&metadata)).await;

        log.append_message(message(0)).await.unwrap();
        log.append_message(message(1)).await.unwrap();

        // Someone else bumps the descriptor behind our back
        let mut foreign = metadata.get_log_info("orders").await.unwrap();
        foreign.touch();
        metadata.update_log_info("orders", foreign).await.unwrap();

        let err = log.append_message(message(2)).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
        assert!(!segment_path(&dir.path().join("orders"), 1).exists());

        let descriptor = log.descriptor().await.unwrap();
        assert_eq!(descriptor.segments.len(), 1);
        assert_eq!(log.last_offset().await, Some(Offset::new(0, 1)));
    }

    #[tokio::test]
    async fn test_topic_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let log = open_log(test_config(&dir), Arc::new(MetadataRegistry::in_memory())).await;
        let err = log
            .append_message(Message::new("payments", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TopicMismatch { .. }));
    }

    #[tokio::test]
    async fn test_close_fails_fast_afterwards() {
        let dir = TempDir::new().unwrap();
        let log = open_log(test_config(&dir), Arc::new(MetadataRegistry::in_memory())).await;
        log.append_message(message(0)).await.unwrap();

        log.close().await.unwrap();
        // Closing twice is fine
        log.close().await.unwrap();

        assert!(matches!(
            log.append_message(message(1)).await,
            Err(Error::StorageClosed(_))
        ));
        assert!(matches!(
            log.query_message(Offset::EARLIEST, 1).await,
            Err(Error::StorageClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_reopen_continues_after_last_entry() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_max_segment_entries(3);
        let metadata_dir = config.metadata_dir();

        {
            let metadata: Arc<dyn MetadataStorage> =
                Arc::new(MetadataRegistry::open(&metadata_dir).await.unwrap());
            let log = open_log(config.clone(), metadata).await;
            for i in 0..5 {
                log.append_message(message(i)).await.unwrap();
            }
            log.close().await.unwrap();
        }

        let metadata: Arc<dyn MetadataStorage> =
            Arc::new(MetadataRegistry::open(&metadata_dir).await.unwrap());
        let log = open_log(config, metadata).await;
        assert_eq!(log.last_offset().await, Some(Offset::new(1, 1)));
        assert_eq!(
            log.append_message(message(5)).await.unwrap(),
            Offset::new(1, 2)
        );

        let result = log.query_message(Offset::EARLIEST, 100).await.unwrap();
        assert_eq!(result.len(), 6);
    }

    #[tokio::test]
    async fn test_reopen_without_descriptor_recovers_segment_files() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_max_segment_entries(3);

        let appended: Vec<Message> = (0..5).map(message).collect();
        {
            let log = open_log(config.clone(), Arc::new(MetadataRegistry::in_memory())).await;
            for msg in &appended {
                log.append_message(msg.clone()).await.unwrap();
            }
            log.close().await.unwrap();
        }

        // A registry that never heard of the topic
        let metadata: Arc<dyn MetadataStorage> = Arc::new(MetadataRegistry::in_memory());
        let log = open_log(config, Arc::clone(&metadata)).await;
        assert_eq!(log.last_offset().await, Some(Offset::new(1, 1)));

        let descriptor = metadata.get_log_info("orders").await.unwrap();
        assert_eq!(descriptor.segments.len(), 2);
        assert!(descriptor.segments[0].is_sealed());
        assert_eq!(descriptor.segments[0].entry_count, 3);
        assert_eq!(descriptor.active_segment().unwrap().segment_id, 1);

        let result = log.query_message(Offset::EARLIEST, 100).await.unwrap();
        let stored: Vec<Message> = result.entries.into_iter().map(|(_, m)| m).collect();
        assert_eq!(stored, appended);

        // Offsets already handed out are never handed out again
        assert_eq!(
            log.append_message(message(5)).await.unwrap(),
            Offset::new(1, 2)
        );
    }

    #[tokio::test]
    async fn test_query_stops_at_removed_segment() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_max_segment_entries(2);
        let metadata_dir = config.metadata_dir();

        {
            let metadata: Arc<dyn MetadataStorage> =
                Arc::new(MetadataRegistry::open(&metadata_dir).await.unwrap());
            let log = open_log(config.clone(), metadata).await;
            for i in 0..6 {
                log.append_message(message(i)).await.unwrap();
            }
            log.close().await.unwrap();
        }
        std::fs::remove_file(segment_path(&dir.path().join("orders"), 1)).unwrap();

        let metadata: Arc<dyn MetadataStorage> =
            Arc::new(MetadataRegistry::open(&metadata_dir).await.unwrap());
        let log = open_log(config, metadata).await;

        assert!(matches!(
            log.query_message(Offset::new(1, 0), 10).await,
            Err(Error::SegmentNotFound { segment_id: 1, .. })
        ));

        // A read from the preceding segment ends at the gap
        let result = log.query_message(Offset::EARLIEST, 10).await.unwrap();
        let got: Vec<Offset> = result.entries.iter().map(|(o, _)| *o).collect();
        assert_eq!(got, vec![Offset::new(0, 0), Offset::new(0, 1)]);
        assert_eq!(result.next_offset, Offset::new(0, 2));

        // Resuming from there reports the gap instead of skipping it
        assert!(matches!(
            log.query_message(result.next_offset, 10).await,
            Err(Error::SegmentNotFound { segment_id: 1, .. })
        ));

        let result = log.query_message(Offset::new(2, 0), 10).await.unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.entries[0].1.sequence_id, 4);
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_unique_offsets() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir)
            .with_max_segment_entries(7)
            .with_pool(PoolConfig::default().with_core_threads(2).with_max_threads(4));
        let log = Arc::new(open_log(config, Arc::new(MetadataRegistry::in_memory())).await);

        let mut handles = Vec::new();
        for i in 0..50 {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                log.append_message(message(i)).await.unwrap()
            }));
        }
        let mut offsets = Vec::new();
        for handle in handles {
            offsets.push(handle.await.unwrap());
        }
        offsets.sort();
        offsets.dedup();
        assert_eq!(offsets.len(), 50);

        // Gapless within each segment
        for segment_id in 0..=offsets.last().unwrap().segment_id {
            let ids: Vec<i64> = offsets
                .iter()
                .filter(|o| o.segment_id == segment_id)
                .map(|o| o.entry_id)
                .collect();
            assert_eq!(ids, (0..ids.len() as i64).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_delete_removes_files_and_descriptor() {
        let dir = TempDir::new().unwrap();
        let metadata: Arc<dyn MetadataStorage> = Arc::new(MetadataRegistry::in_memory());
        let log = open_log(test_config(&dir), Arc::clone(&metadata)).await;
        log.append_message(message(0)).await.unwrap();

        log.delete().await.unwrap();
        assert!(!dir.path().join("orders").exists());
        assert!(metadata.get_log_info("orders").await.unwrap_err().is_not_found());
    }
}
