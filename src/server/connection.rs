//! Signaling connection
//!
//! One task per client. The WebSocket upgrade must finish within the
//! connection timeout; afterwards frames are handled strictly one at a time
//! and every outgoing message, response or notification, goes through a
//! single writer task so the client sees them in the order they were queued.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::{SplitStream, StreamExt};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};

use crate::error::{Error, Result};
use crate::registry::{Notification, RoomRegistry};
use crate::server::config::ServerConfig;
use crate::signaling::{ServerMessage, SignalingSession};
use crate::stats::QualityMonitor;

/// Why the read loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    ByClient,
    Idle,
    WriterGone,
}

pub struct Connection {
    connection_id: u64,
    peer_id: String,
    socket: TcpStream,
    peer_addr: SocketAddr,
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    monitor: Arc<QualityMonitor>,
}

impl Connection {
    pub fn new(
        connection_id: u64,
        socket: TcpStream,
        peer_addr: SocketAddr,
        config: ServerConfig,
        registry: Arc<RoomRegistry>,
        monitor: Arc<QualityMonitor>,
    ) -> Self {
        Self {
            connection_id,
            peer_id: uuid::Uuid::new_v4().to_string(),
            socket,
            peer_addr,
            config,
            registry,
            monitor,
        }
    }

    /// Peer id the client is known by in the registry
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Serve the connection until the client goes away
    pub async fn run(self) -> Result<()> {
        let Connection {
            connection_id,
            peer_id,
            socket,
            peer_addr,
            config,
            registry,
            monitor,
        } = self;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);
        ws_config.max_frame_size = Some(config.max_message_size);

        let upgrade = tokio::time::timeout(
            config.connection_timeout,
            accept_async_with_config(socket, Some(ws_config)),
        )
        .await;
        let ws = match upgrade {
            Ok(ws) => ws?,
            Err(_) => {
                tracing::debug!(connection = connection_id, peer = %peer_addr, "WebSocket upgrade timed out");
                return Ok(());
            }
        };

        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    tracing::debug!(connection = connection_id, error = %e, "Write failed");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let (notifier, mut notifications) = mpsc::unbounded_channel();
        let mut session =
            SignalingSession::new(peer_id.clone(), Some(peer_addr), registry, monitor, notifier);

        tracing::info!(
            connection = connection_id,
            peer = %peer_id,
            addr = %peer_addr,
            "Signaling connection opened"
        );

        let result = read_loop(
            &mut session,
            &mut stream,
            &mut notifications,
            &outbound,
            config.idle_timeout,
        )
        .await;

        session.disconnect().await;
        drop(outbound);
        let _ = writer.await;

        match &result {
            Ok(reason) => tracing::info!(
                connection = connection_id,
                peer = %peer_id,
                reason = ?reason,
                requests = session.state().requests,
                "Signaling connection closed"
            ),
            Err(e) => tracing::info!(
                connection = connection_id,
                peer = %peer_id,
                error = %e,
                "Signaling connection failed"
            ),
        }

        result.map(|_| ())
    }
}

async fn read_loop(
    session: &mut SignalingSession,
    stream: &mut SplitStream<WebSocketStream<TcpStream>>,
    notifications: &mut mpsc::UnboundedReceiver<Notification>,
    outbound: &mpsc::UnboundedSender<Message>,
    idle_timeout: std::time::Duration,
) -> Result<Closed> {
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            frame = stream.next() => {
                idle.as_mut().reset(Instant::now() + idle_timeout);

                let response = match frame {
                    None => return Ok(Closed::ByClient),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Text(text))) => session.handle_text(&text).await,
                    Some(Ok(Message::Binary(_))) => ServerMessage::error(&Error::InvalidMessage(
                        "binary frames are not supported".into(),
                    )),
                    Some(Ok(Message::Close(_))) => return Ok(Closed::ByClient),
                    // Pings are answered by the protocol layer
                    Some(Ok(_)) => continue,
                };

                if !send(outbound, &response)? {
                    return Ok(Closed::WriterGone);
                }
            }

            Some(notification) = notifications.recv() => {
                let message = session.notification(notification);
                if !send(outbound, &message)? {
                    return Ok(Closed::WriterGone);
                }
            }

            _ = &mut idle => {
                tracing::debug!(peer = %session.peer_id(), "Idle timeout");
                return Ok(Closed::Idle);
            }
        }
    }
}

/// Queue a message; false once the writer has stopped
fn send(outbound: &mpsc::UnboundedSender<Message>, message: &ServerMessage) -> Result<bool> {
    let text = message.to_json()?;
    Ok(outbound.send(Message::Text(text)).is_ok())
}
