use fastmq_protocol::{ProtocolError, ServerError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection is not active")]
    NotConnected,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Producer {0} is already registered on this connection")]
    DuplicateProducer(u64),

    #[error("Producer {0} is not registered on this connection")]
    UnknownProducer(u64),

    #[error("Producer {0} was closed")]
    ProducerClosed(u64),

    #[error("Sequence id {sequence_id} of producer {producer_id} is already awaiting a receipt")]
    SequenceInUse { producer_id: u64, sequence_id: u64 },

    #[error("Send {producer_id}/{sequence_id} failed: {error}: {message}")]
    SendFailed {
        producer_id: u64,
        sequence_id: u64,
        error: ServerError,
        message: String,
    },

    #[error("Request rejected by broker: {error}: {message}")]
    Rejected { error: ServerError, message: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, Error>;
