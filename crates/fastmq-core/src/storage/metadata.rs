//! Per-topic log descriptors and the registry that owns them
//!
//! The registry is the single source of truth for which segments a topic has
//! and which one takes appends. Every mutation of one topic's descriptor runs
//! under that topic's own async mutex, so two rollovers of the same topic can
//! never interleave while different topics proceed independently.
//!
//! Optionally each descriptor is persisted as `<dir>/<topic>.json`, written
//! atomically (temp file, fsync, rename) and reloaded on startup.

use crate::{Error, Offset, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DESCRIPTOR_SUFFIX: &str = "json";

/// Lifecycle of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Accepting appends
    Open,
    /// Read only
    Sealed,
}

/// Descriptor entry for one segment of a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub segment_id: i64,
    pub state: SegmentState,
    /// Entries written, known exactly once the segment is sealed
    pub entry_count: u64,
    /// Creation time in milliseconds since epoch
    pub created_at: i64,
    pub sealed_at: Option<i64>,
}

impl SegmentInfo {
    pub fn open(segment_id: i64) -> Self {
        Self {
            segment_id,
            state: SegmentState::Open,
            entry_count: 0,
            created_at: Utc::now().timestamp_millis(),
            sealed_at: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.state == SegmentState::Sealed
    }
}

/// Everything needed to locate any offset ever issued for a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDescriptor {
    pub name: String,
    /// Bumped on every mutation; used for conditional updates
    pub version: u64,
    /// Ordered by segment id, the last one is the active segment
    pub segments: Vec<SegmentInfo>,
    pub created_at: i64,
    pub modified_at: i64,
}

impl LogDescriptor {
    /// Descriptor of a new topic with one open segment
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            name: name.into(),
            version: 0,
            segments: vec![SegmentInfo::open(0)],
            created_at: now,
            modified_at: now,
        }
    }

    /// Rebuild a descriptor from the segment files of a topic, given as
    /// `(segment_id, entry_count)` in ascending id order. The last segment
    /// stays open, all others are sealed with their counted entries.
    pub fn recovered(name: impl Into<String>, found: &[(i64, u64)]) -> Self {
        let now = Utc::now().timestamp_millis();
        let last = found.len().saturating_sub(1);
        let segments = found
            .iter()
            .enumerate()
            .map(|(idx, &(segment_id, entry_count))| {
                let mut info = SegmentInfo::open(segment_id);
                if idx < last {
                    info.state = SegmentState::Sealed;
                    info.entry_count = entry_count;
                    info.sealed_at = Some(now);
                }
                info
            })
            .collect();

        Self {
            name: name.into(),
            version: 0,
            segments,
            created_at: now,
            modified_at: now,
        }
    }

    /// The segment currently taking appends
    pub fn active_segment(&self) -> Option<&SegmentInfo> {
        self.segments
            .last()
            .filter(|segment| segment.state == SegmentState::Open)
    }

    pub fn find_segment(&self, segment_id: i64) -> Option<&SegmentInfo> {
        self.segments
            .binary_search_by_key(&segment_id, |segment| segment.segment_id)
            .ok()
            .map(|idx| &self.segments[idx])
    }

    pub fn first_segment_id(&self) -> Option<i64> {
        self.segments.first().map(|segment| segment.segment_id)
    }

    /// Segment following `segment_id`, if any
    pub fn next_segment(&self, segment_id: i64) -> Option<&SegmentInfo> {
        self.segments
            .iter()
            .find(|segment| segment.segment_id > segment_id)
    }

    /// Offset of the last entry of the newest sealed segment that holds one.
    ///
    /// Entry counts of the open segment live with the segment itself, so the
    /// storage layer refines this with the active segment's own count.
    pub fn last_offset(&self) -> Option<Offset> {
        self.segments
            .iter()
            .rev()
            .find(|segment| segment.entry_count > 0)
            .map(|segment| Offset::new(segment.segment_id, segment.entry_count as i64 - 1))
    }

    /// Seal the active segment with its final entry count and open
    /// `next_segment_id`. Bumps the version.
    pub fn roll_to(&mut self, next_segment_id: i64, sealed_entry_count: u64) {
        let now = Utc::now().timestamp_millis();
        if let Some(active) = self.segments.last_mut() {
            active.state = SegmentState::Sealed;
            active.entry_count = sealed_entry_count;
            active.sealed_at = Some(now);
        }
        self.segments.push(SegmentInfo::open(next_segment_id));
        self.touch();
    }

    /// Bump version and modification time
    pub fn touch(&mut self) {
        self.version += 1;
        self.modified_at = Utc::now().timestamp_millis();
    }
}

/// Storage for per-topic log descriptors
#[async_trait]
pub trait MetadataStorage: Send + Sync {
    /// Current descriptor, `TopicNotFound` if none was ever stored
    async fn get_log_info(&self, name: &str) -> Result<LogDescriptor>;

    /// Replace the descriptor unconditionally
    async fn update_log_info(&self, name: &str, log: LogDescriptor) -> Result<()>;

    /// Replace the descriptor only if the stored version equals
    /// `expected_version` (`None` means no descriptor may exist yet)
    async fn compare_and_update_log_info(
        &self,
        name: &str,
        expected_version: Option<u64>,
        log: LogDescriptor,
    ) -> Result<()>;

    /// Delete the descriptor. Removing an absent descriptor succeeds.
    async fn remove_log_info(&self, name: &str) -> Result<()>;

    /// Names of all stored descriptors, sorted
    async fn list_logs(&self) -> Result<Vec<String>>;
}

type Slot = Arc<Mutex<Option<LogDescriptor>>>;

/// Default [`MetadataStorage`]: a per-topic locked map, optionally backed by
/// JSON files.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    logs: DashMap<String, Slot>,
    dir: Option<PathBuf>,
}

impl MetadataRegistry {
    /// Registry kept in memory only
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Registry persisted under `dir`; existing descriptors are loaded
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let load_dir = dir.clone();
        let loaded = tokio::task::spawn_blocking(move || load_descriptors(&load_dir))
            .await
            .map_err(|e| Error::Other(format!("metadata load task failed: {}", e)))??;

        info!(
            "Loaded {} log descriptors from {}",
            loaded.len(),
            dir.display()
        );

        let logs = DashMap::new();
        for log in loaded {
            logs.insert(log.name.clone(), Arc::new(Mutex::new(Some(log))));
        }

        Ok(Self {
            logs,
            dir: Some(dir),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    /// Lock slot for `name`, created on first use. Slots are never removed
    /// from the map so every caller for one topic shares the same mutex.
    fn slot(&self, name: &str) -> Slot {
        Arc::clone(self.logs.entry(name.to_string()).or_default().value())
    }

    async fn persist(&self, name: &str, log: Option<&LogDescriptor>) -> Result<()> {
        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => return Ok(()),
        };
        let path = dir.join(format!("{}.{}", name, DESCRIPTOR_SUFFIX));

        match log {
            Some(log) => {
                let json = serde_json::to_vec_pretty(log)?;
                let tmp = dir.join(format!("{}.{}.tmp", name, DESCRIPTOR_SUFFIX));
                tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    std::fs::create_dir_all(&dir)?;
                    std::fs::write(&tmp, &json)?;
                    std::fs::File::open(&tmp)?.sync_all()?;
                    std::fs::rename(&tmp, &path)?;
                    if let Ok(parent) = std::fs::File::open(&dir) {
                        let _ = parent.sync_all();
                    }
                    Ok(())
                })
                .await
                .map_err(|e| Error::Other(format!("metadata write task failed: {}", e)))??;
            }
            None => {
                tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                })
                .await
                .map_err(|e| Error::Other(format!("metadata remove task failed: {}", e)))??;
            }
        }
        Ok(())
    }
}

fn load_descriptors(dir: &Path) -> Result<Vec<LogDescriptor>> {
    std::fs::create_dir_all(dir)?;
    let mut logs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(DESCRIPTOR_SUFFIX) {
            continue;
        }
        let content = std::fs::read(&path)?;
        match serde_json::from_slice::<LogDescriptor>(&content) {
            Ok(log) => logs.push(log),
            Err(e) => warn!("Skipping unreadable descriptor {}: {}", path.display(), e),
        }
    }
    Ok(logs)
}

#[async_trait]
impl MetadataStorage for MetadataRegistry {
    async fn get_log_info(&self, name: &str) -> Result<LogDescriptor> {
        let slot = match self.logs.get(name) {
            Some(slot) => Arc::clone(slot.value()),
            None => return Err(Error::TopicNotFound(name.to_string())),
        };
        let guard = slot.lock().await;
        guard
            .clone()
            .ok_or_else(|| Error::TopicNotFound(name.to_string()))
    }

    async fn update_log_info(&self, name: &str, log: LogDescriptor) -> Result<()> {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;
        self.persist(name, Some(&log)).await?;
        debug!("Updated descriptor of {} to version {}", name, log.version);
        *guard = Some(log);
        Ok(())
    }

    async fn compare_and_update_log_info(
        &self,
        name: &str,
        expected_version: Option<u64>,
        log: LogDescriptor,
    ) -> Result<()> {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;
        let actual = guard.as_ref().map(|current| current.version);
        if actual != expected_version {
            return Err(Error::VersionConflict {
                topic: name.to_string(),
                expected: expected_version,
                actual,
            });
        }
        self.persist(name, Some(&log)).await?;
        debug!(
            "Updated descriptor of {} from version {:?} to {}",
            name, expected_version, log.version
        );
        *guard = Some(log);
        Ok(())
    }

    async fn remove_log_info(&self, name: &str) -> Result<()> {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;
        self.persist(name, None).await?;
        if guard.take().is_some() {
            debug!("Removed descriptor of {}", name);
        }
        Ok(())
    }

    async fn list_logs(&self) -> Result<Vec<String>> {
        let slots: Vec<(String, Slot)> = self
            .logs
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut names = Vec::with_capacity(slots.len());
        for (name, slot) in slots {
            if slot.lock().await.is_some() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
