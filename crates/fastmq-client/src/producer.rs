//! Connection-scoped producer state
//!
//! A [`ProducerSession`] hands out sequence ids and keeps one completion
//! handle per send until the broker's receipt (or a failure) arrives for that
//! sequence id. Receipts may arrive in any order.

use crate::{Error, Result};
use fastmq_core::Offset;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

type Completion = oneshot::Sender<Result<SendReceipt>>;

/// Successful completion of one send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub producer_id: u64,
    pub sequence_id: u64,
    /// Durable position, if the broker reported one
    pub offset: Option<Offset>,
}

/// State of one producer on one connection
#[derive(Debug)]
pub struct ProducerSession {
    producer_id: u64,
    producer_name: String,
    topic: String,
    next_sequence_id: AtomicU64,
    pending: Mutex<BTreeMap<u64, Completion>>,
}

impl ProducerSession {
    pub fn new(producer_id: u64, producer_name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            producer_id,
            producer_name: producer_name.into(),
            topic: topic.into(),
            next_sequence_id: AtomicU64::new(0),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn producer_id(&self) -> u64 {
        self.producer_id
    }

    pub fn producer_name(&self) -> &str {
        &self.producer_name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Allocate the next sequence id. Ids are never handed out twice.
    pub fn next_sequence_id(&self) -> u64 {
        self.next_sequence_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Start waiting for the receipt of `sequence_id`.
    ///
    /// The sequence counter moves past `sequence_id` so that ids chosen by the
    /// caller are not allocated again.
    pub fn track(&self, sequence_id: u64) -> Result<PendingSend> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&sequence_id) {
                return Err(Error::SequenceInUse {
                    producer_id: self.producer_id,
                    sequence_id,
                });
            }
            pending.insert(sequence_id, tx);
        }
        self.next_sequence_id
            .fetch_max(sequence_id.saturating_add(1), Ordering::AcqRel);

        Ok(PendingSend {
            producer_id: self.producer_id,
            sequence_id,
            rx,
        })
    }

    /// Complete the send of `sequence_id`. Returns `false` if no such send is
    /// pending (already acknowledged, failed, or never sent).
    pub fn ack_received(&self, sequence_id: u64, offset: Option<Offset>) -> bool {
        let completion = self.pending.lock().remove(&sequence_id);
        match completion {
            Some(tx) => {
                let _ = tx.send(Ok(SendReceipt {
                    producer_id: self.producer_id,
                    sequence_id,
                    offset,
                }));
                true
            }
            None => false,
        }
    }

    /// Fail the send of `sequence_id`; `false` if it is not pending
    pub fn fail(&self, sequence_id: u64, error: Error) -> bool {
        let completion = self.pending.lock().remove(&sequence_id);
        match completion {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every pending send and return how many there were
    pub fn fail_all(&self, error: impl Fn() -> Error) -> usize {
        let drained = std::mem::take(&mut *self.pending.lock());
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Sequence ids still awaiting a receipt, ascending
    pub fn pending_sequence_ids(&self) -> Vec<u64> {
        self.pending.lock().keys().copied().collect()
    }
}

/// Completion of one send; resolves when the receipt or a failure arrives.
///
/// If the session is dropped without resolving the send, this yields
/// [`Error::ConnectionClosed`].
#[derive(Debug)]
pub struct PendingSend {
    producer_id: u64,
    sequence_id: u64,
    rx: oneshot::Receiver<Result<SendReceipt>>,
}

impl PendingSend {
    pub fn producer_id(&self) -> u64 {
        self.producer_id
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }
}

impl Future for PendingSend {
    type Output = Result<SendReceipt>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
