//! FastMQ command protocol
//!
//! Commands exchanged over one client/broker connection. A producer is
//! registered under a connection-scoped id, every send carries a
//! producer-assigned sequence id, and the broker echoes both ids verbatim in
//! the matching receipt or send error.
//!
//! Framing and transport belong to the embedding application; this crate only
//! turns single commands into bytes and back.
//!
//! # Example
//!
//! ```rust,ignore
//! use fastmq_protocol::{BaseCommand, CommandSendReceipt, MessageIdData};
//!
//! let receipt = BaseCommand::SendReceipt(CommandSendReceipt {
//!     producer_id: 7,
//!     sequence_id: 1,
//!     message_id: Some(MessageIdData::new(0, 42)),
//! });
//! let bytes = receipt.to_bytes()?;
//! assert_eq!(BaseCommand::from_bytes(&bytes)?, receipt);
//! ```

mod commands;
mod error;

pub use commands::{
    BaseCommand, CommandCloseProducer, CommandError, CommandProducer, CommandProducerSuccess,
    CommandSend, CommandSendError, CommandSendReceipt, MessageIdData, ServerError,
};
pub use error::{ProtocolError, Result};

/// Maximum encoded command size (64 MiB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
