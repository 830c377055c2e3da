use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fastmq_core::validation::validate_topic_name;
use fastmq_core::{Error as StorageError, Message, StorageManager};
use fastmq_protocol::{
    BaseCommand, CommandCloseProducer, CommandError, CommandProducer, CommandProducerSuccess,
    CommandSend, CommandSendError, CommandSendReceipt, MessageIdData, ServerError,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct RegisteredProducer {
    name: String,
    topic: String,
}

/// Broker side of one client connection
pub struct ServerCnx {
    peer: String,
    storage: Arc<StorageManager>,
    producers: DashMap<u64, RegisteredProducer>,
}

impl ServerCnx {
    pub fn new(peer: impl Into<String>, storage: Arc<StorageManager>) -> Self {
        Self {
            peer: peer.into(),
            storage,
            producers: DashMap::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Process commands from `inbound` in arrival order and write replies to
    /// `outbound` until either side goes away
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        info!("Accepted connection from {}", self.peer);
        while let Some(frame) = inbound.recv().await {
            let reply = match BaseCommand::from_bytes(&frame) {
                Ok(command) => self.handle(command).await,
                Err(e) => {
                    warn!("{} Dropping connection on undecodable command: {}", self.peer, e);
                    break;
                }
            };

            let Some(reply) = reply else { continue };
            let bytes = match reply.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("{} Failed to encode {}: {}", self.peer, reply.name(), e);
                    break;
                }
            };
            if outbound.send(bytes).is_err() {
                break;
            }
        }
        self.producers.clear();
        info!("Connection from {} closed", self.peer);
    }

    /// Handle one command and return the reply, if any
    pub async fn handle(&self, command: BaseCommand) -> Option<BaseCommand> {
        match command {
            BaseCommand::Producer(cmd) => Some(self.handle_producer(cmd)),
            BaseCommand::Send(cmd) => Some(self.handle_send(cmd).await),
            BaseCommand::CloseProducer(cmd) => {
                self.handle_close_producer(cmd);
                None
            }
            other => {
                warn!("{} Unexpected command {} from client", self.peer, other.name());
                None
            }
        }
    }

    fn handle_producer(&self, cmd: CommandProducer) -> BaseCommand {
        if let Err(e) = validate_topic_name(&cmd.topic) {
            return BaseCommand::Error(CommandError {
                request_id: cmd.request_id,
                error: ServerError::InvalidTopicName,
                message: e.to_string(),
            });
        }

        match self.producers.entry(cmd.producer_id) {
            Entry::Occupied(_) => BaseCommand::Error(CommandError {
                request_id: cmd.request_id,
                error: ServerError::ProducerAlreadyExists,
                message: format!("producer {} already registered", cmd.producer_id),
            }),
            Entry::Vacant(entry) => {
                entry.insert(RegisteredProducer {
                    name: cmd.producer_name.clone(),
                    topic: cmd.topic.clone(),
                });
                info!(
                    "{} Created producer {} ({}) on topic {}",
                    self.peer, cmd.producer_id, cmd.producer_name, cmd.topic
                );
                BaseCommand::ProducerSuccess(CommandProducerSuccess {
                    request_id: cmd.request_id,
                    producer_name: cmd.producer_name,
                })
            }
        }
    }

    async fn handle_send(&self, cmd: CommandSend) -> BaseCommand {
        let producer_id = cmd.producer_id;
        let sequence_id = cmd.sequence_id;

        let topic = match self.producers.get(&producer_id) {
            Some(producer) => producer.topic.clone(),
            None => {
                return BaseCommand::SendError(CommandSendError {
                    producer_id,
                    sequence_id,
                    error: ServerError::ProducerNotFound,
                    message: format!("producer {} not registered", producer_id),
                })
            }
        };

        let mut message = Message::new(topic, cmd.payload).with_producer(producer_id, sequence_id);
        message.publish_time = cmd.publish_time;
        message.properties = cmd.properties;

        match self.storage.append_message(message).await {
            Ok(offset) => {
                debug!(
                    "{} Persisted producer {} seq {} at {}",
                    self.peer, producer_id, sequence_id, offset
                );
                BaseCommand::SendReceipt(CommandSendReceipt {
                    producer_id,
                    sequence_id,
                    message_id: Some(MessageIdData::new(offset.segment_id, offset.entry_id)),
                })
            }
            Err(e) => {
                warn!(
                    "{} Failed to persist producer {} seq {}: {}",
                    self.peer, producer_id, sequence_id, e
                );
                BaseCommand::SendError(CommandSendError {
                    producer_id,
                    sequence_id,
                    error: server_error(&e),
                    message: e.to_string(),
                })
            }
        }
    }

    fn handle_close_producer(&self, cmd: CommandCloseProducer) {
        match self.producers.remove(&cmd.producer_id) {
            Some((_, producer)) => info!(
                "{} Closed producer {} ({})",
                self.peer, cmd.producer_id, producer.name
            ),
            None => debug!(
                "{} Close of unknown producer {}",
                self.peer, cmd.producer_id
            ),
        }
    }
}

fn server_error(error: &StorageError) -> ServerError {
    match error {
        StorageError::InvalidTopicName(_) => ServerError::InvalidTopicName,
        StorageError::TopicNotFound(_) => ServerError::TopicNotFound,
        StorageError::StorageClosed(_) | StorageError::PoolShutdown => ServerError::ServiceNotReady,
        _ => ServerError::PersistenceError,
    }
}
