use super::log::LogStorage;
use super::metadata::{MetadataRegistry, MetadataStorage};
use super::{GetMessageResult, MessageStorage};
use crate::pool::ExecutionPool;
use crate::validation::validate_topic_name;
use crate::{Config, Error, Message, Offset, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Owns the execution pool, the metadata registry and one [`LogStorage`] per
/// topic. Logs are opened lazily on first use.
pub struct StorageManager {
    config: Config,
    pool: ExecutionPool,
    owns_pool: bool,
    metadata: Arc<dyn MetadataStorage>,
    logs: RwLock<HashMap<String, Arc<LogStorage>>>,
    /// Serializes opening logs; lookups of open logs never take it
    open_lock: Mutex<()>,
    closed: AtomicBool,
}

impl StorageManager {
    /// Create a manager with its own pool and registry built from `config`
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let pool = ExecutionPool::new(config.pool.clone())?;
        let metadata: Arc<dyn MetadataStorage> = if config.persist_metadata {
            Arc::new(MetadataRegistry::open(config.metadata_dir()).await?)
        } else {
            Arc::new(MetadataRegistry::in_memory())
        };

        info!(
            "Storage manager started in {} (persist_metadata: {})",
            config.data_dir, config.persist_metadata
        );

        Ok(Self {
            config,
            pool,
            owns_pool: true,
            metadata,
            logs: RwLock::new(HashMap::new()),
            open_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a manager on a pool and registry owned by the caller. Closing
    /// the manager leaves the pool running.
    pub fn with_components(
        config: Config,
        pool: ExecutionPool,
        metadata: Arc<dyn MetadataStorage>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pool,
            owns_pool: false,
            metadata,
            logs: RwLock::new(HashMap::new()),
            open_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStorage> {
        Arc::clone(&self.metadata)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StorageClosed("storage manager".into()));
        }
        Ok(())
    }

    /// Log of `topic`, opened on first use
    pub async fn get_or_open(&self, topic: &str) -> Result<Arc<LogStorage>> {
        self.ensure_open()?;
        {
            let logs = self.logs.read().await;
            if let Some(log) = logs.get(topic) {
                return Ok(Arc::clone(log));
            }
        }

        // Opening does pool I/O, so it happens outside the map lock
        let _opening = self.open_lock.lock().await;
        if let Some(log) = self.logs.read().await.get(topic) {
            return Ok(Arc::clone(log));
        }
        let opened = Arc::new(
            LogStorage::open(
                topic,
                self.config.clone(),
                self.pool.clone(),
                Arc::clone(&self.metadata),
            )
            .await?,
        );

        let mut logs = self.logs.write().await;
        // close() drains the map under this lock, so this check is final
        self.ensure_open()?;
        logs.insert(topic.to_string(), Arc::clone(&opened));
        debug!("Opened log {} in storage manager", topic);
        Ok(opened)
    }

    /// Whether the topic has an open log, a stored descriptor or a directory
    /// on disk
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        if self.logs.read().await.contains_key(topic) {
            return Ok(true);
        }
        match self.metadata.get_log_info(topic).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        if validate_topic_name(topic).is_err() {
            return Ok(false);
        }
        Ok(tokio::fs::try_exists(self.config.topic_dir(topic))
            .await
            .unwrap_or(false))
    }

    /// Append to the log of `message.topic`
    pub async fn append_message(&self, message: Message) -> Result<Offset> {
        let log = self.get_or_open(&message.topic).await?;
        log.append_message(message).await
    }

    /// Query the log of `topic`; `TopicNotFound` if it was never written
    pub async fn query_message(
        &self,
        topic: &str,
        offset: Offset,
        max_count: usize,
    ) -> Result<GetMessageResult> {
        self.ensure_open()?;
        if !self.topic_exists(topic).await? {
            return Err(Error::TopicNotFound(topic.to_string()));
        }
        let log = self.get_or_open(topic).await?;
        log.query_message(offset, max_count).await
    }

    /// Close and delete the log of `topic` including its files and descriptor
    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.topic_exists(topic).await? {
            return Err(Error::TopicNotFound(topic.to_string()));
        }

        let log = self.get_or_open(topic).await?;
        self.logs.write().await.remove(topic);
        log.delete().await?;
        info!("Deleted topic '{}'", topic);
        Ok(())
    }

    /// Names of all topics known to the registry
    pub async fn list_topics(&self) -> Result<Vec<String>> {
        self.metadata.list_logs().await
    }

    /// Close every open log, then shut down the pool if this manager owns it
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let logs: Vec<Arc<LogStorage>> = {
            let mut logs = self.logs.write().await;
            logs.drain().map(|(_, log)| log).collect()
        };
        let mut first_error = None;
        for log in logs {
            if let Err(e) = log.close().await {
                warn!("Failed to close log {}: {}", log.topic(), e);
                first_error.get_or_insert(e);
            }
        }

        if self.owns_pool {
            let pool = self.pool.clone();
            tokio::task::spawn_blocking(move || pool.shutdown())
                .await
                .map_err(|e| Error::Interrupted(format!("pool shutdown: {}", e)))?;
        }

        info!("Storage manager closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
