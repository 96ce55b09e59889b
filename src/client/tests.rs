use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

use super::{BrokerClient, InMemoryBrokerClient, WebSocketBrokerClient};
use crate::broker::{Broker, BrokerEvent, Headers};
use crate::transport::websocket::serve;
use crate::utils::error::BrokerError;

async fn next_event(events: &mut UnboundedReceiver<BrokerEvent>) -> Option<BrokerEvent> {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for a broker event")
}

fn headers(sender: &str) -> Headers {
    let mut headers = Headers::new();
    headers.insert("sender".to_string(), sender.to_string());
    headers
}

#[tokio::test]
async fn test_in_memory_clients_share_a_broker() {
    let broker = Arc::new(Mutex::new(Broker::new()));
    let a = InMemoryBrokerClient::new(broker.clone());
    let b = InMemoryBrokerClient::new(broker.clone());
    assert_ne!(a.connection(), b.connection());

    let mut consumer = b.consume("orders").await.unwrap();
    a.publish("orders", headers("a"), b"one".to_vec())
        .await
        .unwrap();

    match next_event(&mut consumer.events).await {
        Some(BrokerEvent::Delivery(msg)) => {
            assert_eq!(msg.payload, b"one");
            assert_eq!(msg.headers, headers("a"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_in_memory_cancel_ends_stream() {
    let broker = Arc::new(Mutex::new(Broker::new()));
    let client = InMemoryBrokerClient::new(broker.clone());

    let mut consumer = client.consume("orders").await.unwrap();
    client.cancel(&consumer.tag).await.unwrap();

    assert_eq!(next_event(&mut consumer.events).await, None);
    assert!(broker.lock().consumers.is_empty());
}

#[tokio::test]
async fn test_in_memory_close_shuts_consumers_down() {
    let broker = Arc::new(Mutex::new(Broker::new()));
    let client = InMemoryBrokerClient::new(broker.clone());
    let other = InMemoryBrokerClient::new(broker.clone());

    let mut consumer = client.consume("orders").await.unwrap();
    let _kept = other.consume("orders").await.unwrap();
    client.close().await;

    assert_eq!(
        next_event(&mut consumer.events).await,
        Some(BrokerEvent::Shutdown {
            initiated_by_application: true
        })
    );
    assert_eq!(next_event(&mut consumer.events).await, None);
    assert_eq!(broker.lock().consumers.len(), 1);

    let err = client
        .publish("orders", Headers::new(), b"late".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Disconnected));
}

async fn spawn_broker() -> (String, Arc<Mutex<Broker>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let broker = Arc::new(Mutex::new(Broker::new()));
    tokio::spawn(serve(listener, broker.clone(), 16));
    (url, broker)
}

#[tokio::test]
async fn test_websocket_connect_to_nothing_is_unreachable() {
    // Grab a free port, then release it so nothing listens there.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let result = WebSocketBrokerClient::connect(&url, "node-a").await;
    assert!(matches!(result, Err(BrokerError::Unreachable { .. })));
}

#[tokio::test]
async fn test_websocket_clients_exchange_messages() {
    let (url, _broker) = spawn_broker().await;
    let a = WebSocketBrokerClient::connect(&url, "node-a").await.unwrap();
    let b = WebSocketBrokerClient::connect(&url, "node-b").await.unwrap();

    let mut consumer = b.consume("orders").await.unwrap();
    a.publish("orders", headers("node-a"), vec![0, 159, 146, 150])
        .await
        .unwrap();

    match next_event(&mut consumer.events).await {
        Some(BrokerEvent::Delivery(msg)) => {
            assert_eq!(msg.destination, "orders");
            assert_eq!(msg.payload, vec![0, 159, 146, 150]);
            assert_eq!(msg.headers, headers("node-a"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_websocket_eviction_is_reported_as_cancelled() {
    let (url, broker) = spawn_broker().await;
    let client = WebSocketBrokerClient::connect(&url, "node-a").await.unwrap();

    let mut consumer = client.consume("orders").await.unwrap();
    assert!(broker.lock().evict(&consumer.tag));

    assert_eq!(
        next_event(&mut consumer.events).await,
        Some(BrokerEvent::Cancelled)
    );
    assert_eq!(next_event(&mut consumer.events).await, None);
}

#[tokio::test]
async fn test_websocket_close_releases_server_side_consumers() {
    let (url, broker) = spawn_broker().await;
    let client = WebSocketBrokerClient::connect(&url, "node-a").await.unwrap();

    let mut consumer = client.consume("orders").await.unwrap();
    assert_eq!(broker.lock().consumers.len(), 1);

    client.close().await;
    assert!(!client.is_connected());
    assert_eq!(
        next_event(&mut consumer.events).await,
        Some(BrokerEvent::Shutdown {
            initiated_by_application: true
        })
    );

    for _ in 0..50 {
        if broker.lock().consumers.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("broker kept the consumers of a closed client");
}
