//! WebSocket broker server
//!
//! Translates the JSON frames in [`super::message`] into broker operations.
//! Responsibilities:
//! - Accept TCP/WebSocket connections, up to a configured limit
//! - Bind, cancel and feed consumers on behalf of each connection
//! - Forward every consumer's events back over the owning socket
//! - Remove a connection's consumers once it goes away
//!
//! Each connection gets one writer task draining an unbounded channel, and
//! each consumer gets a small forwarder task feeding that channel, so the
//! broker lock is never held across socket I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, trace, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::{Broker, BrokerEvent, BrokerMessage};
use crate::transport::message::{ClientFrame, ServerFrame};
use crate::utils::error::BrokerError;

/// Binds `addr` and serves until the listener fails.
pub async fn start_websocket_server(
    addr: &str,
    broker: Arc<Mutex<Broker>>,
    max_connections: usize,
) -> Result<(), BrokerError> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket broker listening on ws://{}", listener.local_addr()?);
    serve(listener, broker, max_connections).await;
    Ok(())
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, broker: Arc<Mutex<Broker>>, max_connections: usize) {
    let active = Arc::new(AtomicUsize::new(0));

    while let Ok((stream, peer)) = listener.accept().await {
        if active.load(Ordering::SeqCst) >= max_connections {
            warn!(%peer, max_connections, "Connection limit reached, refusing client");
            drop(stream);
            continue;
        }

        active.fetch_add(1, Ordering::SeqCst);
        let broker = broker.clone();
        let active = active.clone();
        spawn(async move {
            handle_connection(stream, broker).await;
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    error!("WebSocket broker stopped accepting connections");
}

async fn handle_connection(stream: TcpStream, broker: Arc<Mutex<Broker>>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };

    let connection = format!("conn-{}", Uuid::new_v4().simple());
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    {
        let connection = connection.clone();
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!(%connection, "Failed to write frame: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
            trace!(%connection, "Send loop closed");
        });
    }

    debug!(%connection, "Connection opened");

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientFrame>(text.as_str()) {
            Ok(frame) => handle_frame(frame, &connection, &broker, &tx),
            Err(err) => {
                warn!(
                    %connection,
                    "Invalid client frame: {err} | {}",
                    text.as_str().chars().take(100).collect::<String>()
                );
                send(
                    &tx,
                    &ServerFrame::Error {
                        tag: None,
                        message: format!("invalid frame: {err}"),
                    },
                );
            }
        }
    }

    let removed = broker.lock().cleanup_connection(&connection);
    info!(%connection, consumers = removed, "Connection closed");
}

pub(crate) fn handle_frame(
    frame: ClientFrame,
    connection: &str,
    broker: &Mutex<Broker>,
    tx: &UnboundedSender<WsMessage>,
) {
    match frame {
        ClientFrame::Hello { client } => {
            info!(connection, client, "Client identified");
        }
        ClientFrame::Consume { destination, tag } => {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let bound = broker
                .lock()
                .consume(connection, &destination, tag.clone(), events_tx);
            match bound {
                Ok(()) => {
                    // consume_ok is queued before any delivery for this tag.
                    send(tx, &ServerFrame::ConsumeOk { tag: tag.clone() });
                    spawn(forward_events(tag, events_rx, tx.clone()));
                }
                Err(err) => {
                    send(
                        tx,
                        &ServerFrame::Error {
                            tag: Some(tag),
                            message: err.to_string(),
                        },
                    );
                }
            }
        }
        ClientFrame::Cancel { tag } => {
            let mut broker = broker.lock();
            let owner = broker
                .consumers
                .get(&tag)
                .map(|consumer| consumer.connection.clone());
            match owner {
                Some(owner) if owner != connection => {
                    drop(broker);
                    send(
                        tx,
                        &ServerFrame::Error {
                            tag: Some(tag),
                            message: "consumer belongs to another connection".to_string(),
                        },
                    );
                }
                _ => {
                    broker.cancel(&tag);
                    drop(broker);
                    send(tx, &ServerFrame::CancelOk { tag });
                }
            }
        }
        ClientFrame::Publish {
            destination,
            headers,
            payload,
        } => {
            let delivered = broker.lock().publish(BrokerMessage {
                destination: destination.clone(),
                headers,
                payload,
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
            trace!(connection, %destination, delivered, "Published");
        }
    }
}

async fn forward_events(
    tag: String,
    mut events: UnboundedReceiver<BrokerEvent>,
    tx: UnboundedSender<WsMessage>,
) {
    while let Some(event) = events.recv().await {
        let frame = match event {
            BrokerEvent::Delivery(message) => ServerFrame::Deliver {
                tag: tag.clone(),
                destination: message.destination,
                headers: message.headers,
                payload: message.payload,
                timestamp: message.timestamp,
            },
            BrokerEvent::Cancelled => ServerFrame::Cancelled { tag: tag.clone() },
            BrokerEvent::Shutdown { .. } => break,
        };
        if !send(&tx, &frame) {
            break;
        }
    }
}

fn send(tx: &UnboundedSender<WsMessage>, frame: &ServerFrame) -> bool {
    match frame.to_ws() {
        Ok(msg) => tx.send(msg).is_ok(),
        Err(e) => {
            error!("Failed to encode server frame: {e}");
            false
        }
    }
}
