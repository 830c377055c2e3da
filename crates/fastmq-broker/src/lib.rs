//! # fastmq-broker
//!
//! Broker side of a FastMQ connection. [`ServerCnx`] registers producers,
//! appends their sends to the [`StorageManager`](fastmq_core::StorageManager)
//! and answers every send with a receipt carrying the durable offset, or with
//! a send error echoing the producer and sequence ids.

pub mod server_cnx;

pub use server_cnx::ServerCnx;
