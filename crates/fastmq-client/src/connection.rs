//! Client side of one broker connection
//!
//! [`ClientCnx`] owns the producer table of a connection and correlates
//! inbound receipts with outstanding sends by `(producer_id, sequence_id)`.
//!
//! # Failure policy
//!
//! - a receipt for an unknown producer is logged and dropped
//! - a send error from the broker closes the connection
//! - an exception while handling inbound data closes the connection
//! - once closed, every pending send fails with [`Error::ConnectionClosed`]
//!   (see [`ConnectionConfig::fail_pending_on_close`]) and inbound commands
//!   are ignored
//!
//! Transport is not handled here: inbound commands are pushed in through the
//! `handle_*` methods, outbound commands leave through an mpsc channel.

use crate::producer::{PendingSend, ProducerSession};
use crate::{Error, Result};
use bytes::Bytes;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fastmq_core::Offset;
use fastmq_protocol::{
    BaseCommand, CommandCloseProducer, CommandError, CommandProducer, CommandProducerSuccess,
    CommandSend, CommandSendError, CommandSendReceipt,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Fail every pending send when the connection closes. When disabled the
    /// producer sessions and their pending sends are left untouched for a
    /// higher layer to inspect and resubmit.
    pub fail_pending_on_close: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            fail_pending_on_close: true,
        }
    }
}

impl ConnectionConfig {
    pub fn with_fail_pending_on_close(mut self, enabled: bool) -> Self {
        self.fail_pending_on_close = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closed,
}

/// Client side of one connection to a broker
pub struct ClientCnx {
    peer: String,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    producers: DashMap<u64, Arc<ProducerSession>>,
    /// Registration request id -> producer id, until the broker answers
    pending_registrations: DashMap<u64, u64>,
    next_request_id: AtomicU64,
    outbound: mpsc::UnboundedSender<BaseCommand>,
    stats: CnxStats,
}

impl ClientCnx {
    /// Create a connection that writes outbound commands to `outbound`
    pub fn new(
        peer: impl Into<String>,
        config: ConnectionConfig,
        outbound: mpsc::UnboundedSender<BaseCommand>,
    ) -> Self {
        Self {
            peer: peer.into(),
            config,
            state: Mutex::new(ConnectionState::Connecting),
            producers: DashMap::new(),
            pending_registrations: DashMap::new(),
            next_request_id: AtomicU64::new(0),
            outbound,
            stats: CnxStats::default(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Transport is up. No handshake is needed to become active.
    pub fn connection_established(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Active;
            info!("Connected to broker {}", self.peer);
        }
    }

    /// Add `session` to the producer table.
    ///
    /// A second registration under a live producer id is rejected; the
    /// existing session and its pending sends are left as they are.
    pub fn register_producer(&self, session: Arc<ProducerSession>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let producer_id = session.producer_id();
        match self.producers.entry(producer_id) {
            Entry::Occupied(_) => {
                warn!(
                    "{} Rejected duplicate registration of producer {}",
                    self.peer, producer_id
                );
                return Err(Error::DuplicateProducer(producer_id));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
            }
        }

        // close() may have swept the table between the state check and the
        // insert; a closed connection keeps no new sessions
        if self.is_closed() {
            self.producers
                .remove_if(&producer_id, |_, current| Arc::ptr_eq(current, &session));
            return Err(Error::ConnectionClosed);
        }
        debug!("{} Registered producer {}", self.peer, producer_id);
        Ok(())
    }

    /// Register a producer locally and announce it to the broker
    pub fn create_producer(
        &self,
        producer_id: u64,
        producer_name: impl Into<String>,
        topic: impl Into<String>,
    ) -> Result<Arc<ProducerSession>> {
        let session = Arc::new(ProducerSession::new(producer_id, producer_name, topic));
        self.register_producer(Arc::clone(&session))?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.pending_registrations.insert(request_id, producer_id);
        if self.is_closed() {
            self.pending_registrations.remove(&request_id);
            self.producers
                .remove_if(&producer_id, |_, current| Arc::ptr_eq(current, &session));
            return Err(Error::ConnectionClosed);
        }
        let command = BaseCommand::Producer(CommandProducer {
            producer_id,
            request_id,
            producer_name: session.producer_name().to_string(),
            topic: session.topic().to_string(),
        });
        if let Err(e) = self.emit(command) {
            self.pending_registrations.remove(&request_id);
            self.producers
                .remove_if(&producer_id, |_, current| Arc::ptr_eq(current, &session));
            return Err(e);
        }
        Ok(session)
    }

    pub fn producer(&self, producer_id: u64) -> Option<Arc<ProducerSession>> {
        self.producers
            .get(&producer_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Send `payload` under `producer_id` with the next sequence id
    pub fn send(&self, producer_id: u64, payload: impl Into<Bytes>) -> Result<PendingSend> {
        self.send_with_properties(producer_id, payload, Vec::new())
    }

    pub fn send_with_properties(
        &self,
        producer_id: u64,
        payload: impl Into<Bytes>,
        properties: Vec<(String, String)>,
    ) -> Result<PendingSend> {
        if self.state() != ConnectionState::Active {
            return Err(Error::NotConnected);
        }
        let session = self
            .producer(producer_id)
            .ok_or(Error::UnknownProducer(producer_id))?;

        let sequence_id = session.next_sequence_id();
        let pending = session.track(sequence_id)?;

        // close() may have drained the session between the state check and
        // track(); do not leave this send behind
        if self.is_closed() {
            session.fail(sequence_id, Error::ConnectionClosed);
            return Err(Error::ConnectionClosed);
        }

        let command = BaseCommand::Send(CommandSend {
            producer_id,
            sequence_id,
            payload: payload.into(),
            publish_time: Utc::now().timestamp_millis(),
            properties,
        });
        if let Err(e) = self.emit(command) {
            session.fail(sequence_id, Error::ConnectionClosed);
            return Err(e);
        }

        self.stats.sends.fetch_add(1, Ordering::Relaxed);
        Ok(pending)
    }

    /// Tear down one producer: its pending sends fail with
    /// [`Error::ProducerClosed`] and the broker is told to close it
    pub fn close_producer(&self, producer_id: u64) -> Result<()> {
        let (_, session) = self
            .producers
            .remove(&producer_id)
            .ok_or(Error::UnknownProducer(producer_id))?;
        let failed = session.fail_all(|| Error::ProducerClosed(producer_id));
        debug!(
            "{} Closed producer {} ({} pending sends failed)",
            self.peer, producer_id, failed
        );

        if self.is_closed() {
            return Ok(());
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.emit(BaseCommand::CloseProducer(CommandCloseProducer {
            producer_id,
            request_id,
        }))
    }

    fn emit(&self, command: BaseCommand) -> Result<()> {
        if self.outbound.send(command).is_err() {
            warn!("{} Outbound channel gone, closing connection", self.peer);
            self.close();
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Decode and dispatch one inbound command. Undecodable input is treated
    /// like any other exception and closes the connection.
    pub fn handle_bytes(&self, data: &[u8]) {
        match BaseCommand::from_bytes(data) {
            Ok(command) => self.handle_command(command),
            Err(e) => self.exception_caught(&e),
        }
    }

    /// Dispatch one inbound command
    pub fn handle_command(&self, command: BaseCommand) {
        if self.is_closed() {
            debug!("{} Ignoring {} on closed connection", self.peer, command.name());
            return;
        }
        match command {
            BaseCommand::ProducerSuccess(cmd) => self.handle_producer_success(cmd),
            BaseCommand::SendReceipt(cmd) => self.handle_send_receipt(cmd),
            BaseCommand::SendError(cmd) => self.handle_send_error(cmd),
            BaseCommand::Error(cmd) => self.handle_error(cmd),
            other => {
                let e = Error::Protocol(fastmq_protocol::ProtocolError::UnexpectedCommand(
                    other.name(),
                ));
                self.exception_caught(&e);
            }
        }
    }

    pub fn handle_producer_success(&self, cmd: CommandProducerSuccess) {
        self.pending_registrations.remove(&cmd.request_id);
        debug!(
            "{} Received producer success response from server: {} - producer-name: {}",
            self.peer, cmd.request_id, cmd.producer_name
        );
    }

    pub fn handle_send_receipt(&self, cmd: CommandSendReceipt) {
        if self.is_closed() {
            return;
        }
        let producer_id = cmd.producer_id;
        let sequence_id = cmd.sequence_id;
        let offset = cmd
            .message_id
            .map(|id| Offset::new(id.segment_id, id.entry_id));

        let session = match self.producer(producer_id) {
            Some(session) => session,
            None => {
                self.stats
                    .unknown_producer_receipts
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{} Producer[{}] not registered, ignoring receipt {} at {:?}",
                    self.peer, producer_id, sequence_id, offset
                );
                return;
            }
        };

        if session.ack_received(sequence_id, offset) {
            self.stats.receipts.fetch_add(1, Ordering::Relaxed);
            debug!(
                "{} Got send receipt for producer[{}]: seq {} at {:?}",
                self.peer, producer_id, sequence_id, offset
            );
        } else {
            self.stats.duplicate_receipts.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{} Producer[{}] has no pending send {}, dropping receipt",
                self.peer, producer_id, sequence_id
            );
        }
    }

    /// A broker-side send failure is fatal for the whole connection
    pub fn handle_send_error(&self, cmd: CommandSendError) {
        if self.is_closed() {
            return;
        }
        self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
        warn!(
            "{} Received send error from server: producer {} seq {}: {} ({})",
            self.peer, cmd.producer_id, cmd.sequence_id, cmd.error, cmd.message
        );

        if let Some(session) = self.producer(cmd.producer_id) {
            session.fail(
                cmd.sequence_id,
                Error::SendFailed {
                    producer_id: cmd.producer_id,
                    sequence_id: cmd.sequence_id,
                    error: cmd.error,
                    message: cmd.message,
                },
            );
        }
        self.close();
    }

    /// A rejected producer registration removes the producer; any other
    /// request error is only logged
    pub fn handle_error(&self, cmd: CommandError) {
        warn!(
            "{} Request {} failed: {} ({})",
            self.peer, cmd.request_id, cmd.error, cmd.message
        );
        if let Some((_, producer_id)) = self.pending_registrations.remove(&cmd.request_id) {
            if let Some((_, session)) = self.producers.remove(&producer_id) {
                session.fail_all(|| Error::Rejected {
                    error: cmd.error,
                    message: cmd.message.clone(),
                });
            }
        }
    }

    /// Any failure while processing inbound data closes the connection
    pub fn exception_caught(&self, cause: &dyn std::error::Error) {
        warn!("{} Exception caught: {}", self.peer, cause);
        self.close();
    }

    /// Transport went away
    pub fn connection_lost(&self) {
        info!("{} Connection lost", self.peer);
        self.close();
    }

    /// Move to Closed. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        if !self.config.fail_pending_on_close {
            info!("{} Connection closed", self.peer);
            return;
        }

        let sessions: Vec<Arc<ProducerSession>> = self
            .producers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.producers.clear();
        self.pending_registrations.clear();

        let failed: usize = sessions
            .iter()
            .map(|session| session.fail_all(|| Error::ConnectionClosed))
            .sum();
        info!(
            "{} Connection closed, failed {} pending sends of {} producers",
            self.peer,
            failed,
            sessions.len()
        );
    }

    pub fn stats(&self) -> CnxStatsSnapshot {
        CnxStatsSnapshot {
            sends: self.stats.sends.load(Ordering::Relaxed),
            receipts: self.stats.receipts.load(Ordering::Relaxed),
            duplicate_receipts: self.stats.duplicate_receipts.load(Ordering::Relaxed),
            unknown_producer_receipts: self.stats.unknown_producer_receipts.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ClientCnx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCnx")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("producers", &self.producers.len())
            .finish()
    }
}

#[derive(Default)]
struct CnxStats {
    sends: AtomicU64,
    receipts: AtomicU64,
    duplicate_receipts: AtomicU64,
    unknown_producer_receipts: AtomicU64,
    send_errors: AtomicU64,
}

/// Snapshot of connection statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnxStatsSnapshot {
    /// Sends handed to the transport
    pub sends: u64,
    /// Receipts that completed a pending send
    pub receipts: u64,
    /// Receipts for sequence ids that were not pending
    pub duplicate_receipts: u64,
    /// Receipts for producers not registered on this connection
    pub unknown_producer_receipts: u64,
    /// Send errors received from the broker
    pub send_errors: u64,
}

impl CnxStatsSnapshot {
    /// Sends still waiting for a receipt or failure
    pub fn in_flight(&self) -> u64 {
        self.sends.saturating_sub(self.receipts + self.send_errors)
    }
}
