//! End-to-end produce/acknowledge tests
//!
//! A client connection and a broker connection are wired in-process through
//! channels carrying encoded commands, so every command crosses the same
//! byte boundary a socket would.
//!
//! Run with: cargo test -p fastmq-broker --test produce_ack -- --nocapture

use anyhow::Result;
use bytes::Bytes;
use fastmq_broker::ServerCnx;
use fastmq_client::{ClientCnx, ConnectionConfig, ConnectionState, Error as ClientError};
use fastmq_core::{Config, Offset, PoolConfig, StorageManager};
use fastmq_protocol::{BaseCommand, ServerError};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tracing::info;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fastmq_core=debug".parse().unwrap())
                .add_directive("fastmq_client=debug".parse().unwrap())
                .add_directive("fastmq_broker=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

async fn start_storage(dir: &TempDir) -> Result<Arc<StorageManager>> {
    let config = Config::new()
        .with_data_dir(dir.path().to_string_lossy().to_string())
        .with_sync_on_append(false)
        .with_max_segment_entries(4)
        .with_pool(
            PoolConfig::default()
                .with_name("test-storage")
                .with_core_threads(2)
                .with_max_threads(4),
        );
    Ok(Arc::new(StorageManager::new(config).await?))
}

/// Wire a client connection to a broker connection through encoded frames
fn connect(storage: Arc<StorageManager>) -> (Arc<ClientCnx>, Arc<ServerCnx>) {
    let (client_out_tx, mut client_out_rx) = mpsc::unbounded_channel::<BaseCommand>();
    let (to_broker_tx, to_broker_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let client = Arc::new(ClientCnx::new(
        "broker:test",
        ConnectionConfig::default(),
        client_out_tx,
    ));
    let server = Arc::new(ServerCnx::new("client:test", storage));

    tokio::spawn(Arc::clone(&server).run(to_broker_rx, to_client_tx));

    tokio::spawn(async move {
        while let Some(command) = client_out_rx.recv().await {
            let Ok(bytes) = command.to_bytes() else { break };
            if to_broker_tx.send(bytes).is_err() {
                break;
            }
        }
    });

    let reader = Arc::clone(&client);
    tokio::spawn(async move {
        while let Some(frame) = to_client_rx.recv().await {
            reader.handle_bytes(&frame);
        }
        reader.connection_lost();
    });

    client.connection_established();
    (client, server)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_receipts_carry_durable_offsets() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let storage = start_storage(&dir).await?;
    let (client, _server) = connect(Arc::clone(&storage));

    client.create_producer(1, "orders-producer", "orders")?;
    client.create_producer(2, "payments-producer", "payments")?;

    let mut orders = Vec::new();
    let mut payments = Vec::new();
    for i in 0..10 {
        orders.push(client.send(1, format!("order-{}", i))?);
        payments.push(client.send(2, format!("payment-{}", i))?);
    }

    let mut order_offsets = Vec::new();
    for pending in orders {
        let receipt = pending.await?;
        assert_eq!(receipt.producer_id, 1);
        order_offsets.push(receipt.offset.expect("broker reports offsets"));
    }
    for pending in payments {
        let receipt = pending.await?;
        assert_eq!(receipt.producer_id, 2);
    }
    info!("Orders acknowledged at {:?}", order_offsets);

    // Four entries per segment, written in send order
    let expected: Vec<Offset> = (0..10)
        .map(|i| Offset::new(i / 4, i % 4))
        .collect();
    assert_eq!(order_offsets, expected);

    let stored = storage
        .query_message("orders", Offset::EARLIEST, 100)
        .await?;
    assert_eq!(stored.len(), 10);
    for (i, (offset, message)) in stored.entries.iter().enumerate() {
        assert_eq!(*offset, order_offsets[i]);
        assert_eq!(message.payload, Bytes::from(format!("order-{}", i)));
        assert_eq!(message.producer_id, 1);
        assert_eq!(message.sequence_id, i as u64);
    }
    assert_eq!(stored.next_offset, Offset::new(2, 2));

    let stats = client.stats();
    assert_eq!(stats.receipts, 20);
    assert_eq!(stats.in_flight(), 0);
    assert_eq!(client.state(), ConnectionState::Active);

    storage.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_broker_send_error_closes_client_connection() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let storage = start_storage(&dir).await?;
    let (client, _server) = connect(Arc::clone(&storage));

    client.create_producer(1, "orders-producer", "orders")?;
    let first = client.send(1, "a")?;
    first.await?;

    // Storage goes away underneath the broker
    storage.close().await?;

    let failing = client.send(1, "b")?;
    let abandoned = client.send(1, "c")?;

    match failing.await {
        Err(ClientError::SendFailed {
            producer_id: 1,
            error,
            ..
        }) => assert_eq!(error, ServerError::ServiceNotReady),
        other => panic!("unexpected result {:?}", other),
    }
    assert!(matches!(abandoned.await, Err(ClientError::ConnectionClosed)));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(client.send(1, "d"), Err(ClientError::NotConnected)));
    Ok(())
}

#[tokio::test]
async fn test_close_producer_reaches_broker() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let storage = start_storage(&dir).await?;
    let (client, server) = connect(Arc::clone(&storage));

    client.create_producer(1, "orders-producer", "orders")?;
    client.send(1, "a")?.await?;
    assert_eq!(server.producer_count(), 1);

    client.close_producer(1)?;
    assert!(wait_until(|| server.producer_count() == 0).await);

    // The id is free again on both sides
    client.create_producer(1, "orders-producer", "orders")?;
    let receipt = client.send(1, "b")?.await?;
    assert_eq!(receipt.offset, Some(Offset::new(0, 1)));

    storage.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_rejected_producer_is_removed_on_client() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let storage = start_storage(&dir).await?;
    let (client, _server) = connect(Arc::clone(&storage));

    client.create_producer(5, "bad", "not a topic")?;
    assert!(wait_until(|| client.producer(5).is_none()).await);
    assert_eq!(client.state(), ConnectionState::Active);

    storage.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_acknowledged_messages_survive_restart() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;

    let offsets = {
        let storage = start_storage(&dir).await?;
        let (client, _server) = connect(Arc::clone(&storage));
        client.create_producer(1, "orders-producer", "orders")?;

        let mut offsets = Vec::new();
        for i in 0..6 {
            let receipt = client.send(1, format!("order-{}", i))?.await?;
            offsets.push(receipt.offset.expect("broker reports offsets"));
        }
        storage.close().await?;
        offsets
    };

    let storage = start_storage(&dir).await?;
    let stored = storage
        .query_message("orders", Offset::EARLIEST, 100)
        .await?;
    let stored_offsets: Vec<Offset> = stored.entries.iter().map(|(o, _)| *o).collect();
    assert_eq!(stored_offsets, offsets);

    storage.close().await?;
    Ok(())
}
