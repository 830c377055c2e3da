//! # fastmq-client
//!
//! Connection layer of the FastMQ client: many producers share one broker
//! connection, every send gets a producer-local sequence id, and the broker's
//! receipts are matched back to the waiting send by `(producer_id,
//! sequence_id)` regardless of arrival order.
//!
//! ```rust,ignore
//! use fastmq_client::{ClientCnx, ConnectionConfig};
//! use tokio::sync::mpsc;
//!
//! let (outbound, mut to_broker) = mpsc::unbounded_channel();
//! let cnx = ClientCnx::new("broker:6650", ConnectionConfig::default(), outbound);
//! cnx.connection_established();
//!
//! cnx.create_producer(1, "orders-producer", "orders")?;
//! let pending = cnx.send(1, "hello")?;
//! // ... the transport writes `to_broker` and feeds replies to cnx.handle_bytes()
//! let receipt = pending.await?;
//! println!("stored at {:?}", receipt.offset);
//! ```

pub mod connection;
pub mod error;
pub mod producer;

pub use connection::{ClientCnx, CnxStatsSnapshot, ConnectionConfig, ConnectionState};
pub use error::{Error, Result};
pub use producer::{PendingSend, ProducerSession, SendReceipt};
