//! WebSocket push endpoint
//!
//! Every accepted socket becomes a hub client. A writer task drains the
//! client's outbound queue into the socket; the read half feeds pongs and
//! application pings back to the hub.

use crate::services::hub::{BroadcastHub, ClientConnection, Outbound};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Bind the push port and serve until shutdown
pub async fn start_push_server(
    port: u16,
    hub: Arc<BroadcastHub>,
    client_buffer: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    serve_push(listener, hub, client_buffer, shutdown).await;
    Ok(())
}

/// Accept loop on an already bound listener
pub async fn serve_push(
    listener: TcpListener,
    hub: Arc<BroadcastHub>,
    client_buffer: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    info!(port = %port, "push_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let hub = hub.clone();
                        tokio::spawn(handle_socket(stream, peer, hub, client_buffer));
                    }
                    Err(e) => {
                        error!(error = %e, "push_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("push_server_shutdown");
                    return;
                }
            }
        }
    }
}

async fn handle_socket(stream: TcpStream, peer: SocketAddr, hub: Arc<BroadcastHub>, client_buffer: usize) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "push_handshake_failed");
            return;
        }
    };
    let (sink, source) = ws.split();

    let (tx, rx) = mpsc::channel(client_buffer.max(1));
    let client = hub.register(tx);
    info!(client_id = %client.id, peer = %peer, "push_client_connected");

    let writer = tokio::spawn(write_loop(sink, rx, client.clone()));
    read_loop(source, &hub, &client).await;

    hub.unregister(&client.id);
    let _ = writer.await;
    info!(
        client_id = %client.id,
        peer = %peer,
        connected_secs = %client.connected_at.elapsed().as_secs(),
        "push_client_disconnected"
    );
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Outbound>, client: Arc<ClientConnection>) {
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let message = match frame {
                    Outbound::Text(json) => Message::text(json.to_string()),
                    Outbound::Probe => Message::Ping(Bytes::new()),
                };
                if let Err(e) = sink.send(message).await {
                    debug!(client_id = %client.id, error = %e, "push_write_failed");
                    client.close();
                    break;
                }
            }
            _ = client.closed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut source: WsSource, hub: &BroadcastHub, client: &ClientConnection) {
    loop {
        tokio::select! {
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => hub.on_client_text(client, text.as_str()),
                Some(Ok(Message::Pong(_))) => client.record_pong(),
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered by the protocol layer; binary is not part of the protocol
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client_id = %client.id, error = %e, "push_read_failed");
                    break;
                }
            },
            _ = client.closed() => break,
        }
    }
}
