//! Per-connection signaling handler
//!
//! A `SignalingSession` turns decoded requests into registry calls and the
//! results into responses. It is driven by exactly one connection, one
//! request at a time, so requests from the same peer are applied in arrival
//! order. Failures become an `error` response for this connection only.

use std::net::SocketAddr;
use std::sync::Arc;

use super::message::{ClientMessage, ServerMessage, TransportParams};
use crate::engine::ProducerOptions;
use crate::error::{Error, Result};
use crate::registry::{Notification, Notifier, RoomRegistry, TransportDirection};
use crate::session::SessionState;
use crate::stats::QualityMonitor;

/// Consumers are always plain forwarding consumers
const CONSUMER_TYPE: &str = "simple";

/// Longest chat message relayed, in characters
const MAX_CHAT_LENGTH: usize = 4096;

pub struct SignalingSession {
    registry: Arc<RoomRegistry>,
    monitor: Arc<QualityMonitor>,
    /// Handed to the registry on join; notifications for this peer arrive on
    /// the matching receiver held by the connection
    notifier: Notifier,
    state: SessionState,
}

impl SignalingSession {
    pub fn new(
        peer_id: impl Into<String>,
        peer_addr: Option<SocketAddr>,
        registry: Arc<RoomRegistry>,
        monitor: Arc<QualityMonitor>,
        notifier: Notifier,
    ) -> Self {
        Self {
            registry,
            monitor,
            notifier,
            state: SessionState::new(peer_id, peer_addr),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.state.peer_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Decode and handle a text frame
    pub async fn handle_text(&mut self, text: &str) -> ServerMessage {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                self.state.record_request(true);
                tracing::debug!(peer = %self.state.peer_id, error = %e, "Undecodable frame");
                ServerMessage::error(&e)
            }
        }
    }

    /// Handle one request and produce its response
    pub async fn handle(&mut self, message: ClientMessage) -> ServerMessage {
        let request = message.name();

        match self.dispatch(message).await {
            Ok(response) => {
                self.state.record_request(false);
                response
            }
            Err(e) => {
                self.state.record_request(true);
                if e.is_fatal() {
                    tracing::error!(peer = %self.state.peer_id, request, error = %e, "Request hit a dead worker");
                } else {
                    tracing::debug!(peer = %self.state.peer_id, request, error = %e, "Request failed");
                }
                ServerMessage::error(&e)
            }
        }
    }

    /// Turn a registry notification into the message pushed to the client
    pub fn notification(&mut self, notification: Notification) -> ServerMessage {
        if let Notification::RoomClosed { room_id } = &notification {
            if self.state.room_id() == Some(room_id.as_str()) {
                self.state.leave();
            }
        }
        ServerMessage::from(notification)
    }

    /// Release everything the peer holds
    ///
    /// Called once when the connection goes away, whatever the reason.
    pub async fn disconnect(&mut self) {
        self.state.close();
        if let Some(room_id) = self.state.leave() {
            self.registry.remove_peer(&room_id, &self.state.peer_id).await;
        }
        self.state.finish();

        tracing::debug!(
            peer = %self.state.peer_id,
            requests = self.state.requests,
            failed = self.state.failed_requests,
            duration_secs = self.state.duration().as_secs(),
            "Signaling session ended"
        );
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<ServerMessage> {
        let peer_id = self.state.peer_id.clone();

        match message {
            ClientMessage::JoinRoom {
                room_id,
                rtp_capabilities,
            } => {
                let joined = match self
                    .registry
                    .join_room(&room_id, &peer_id, rtp_capabilities, self.notifier.clone())
                    .await
                {
                    Ok(joined) => joined,
                    Err(e) => {
                        // The previous room may already have been left
                        if self.registry.room_of(&peer_id).await.is_none() {
                            self.state.leave();
                        }
                        return Err(e);
                    }
                };
                self.state.join(room_id);

                Ok(ServerMessage::RouterRtpCapabilities {
                    rtp_capabilities: joined.rtp_capabilities,
                    producers: joined.producers,
                })
            }

            ClientMessage::CreateProducerTransport { room_id } => {
                let room_id = self.target_room(room_id)?;
                let transport = self
                    .registry
                    .create_transport(&room_id, &peer_id, TransportDirection::Producer)
                    .await?;
                Ok(ServerMessage::ProducerTransportCreated(
                    TransportParams::from(&transport),
                ))
            }

            ClientMessage::CreateConsumerTransport { room_id } => {
                let room_id = self.target_room(room_id)?;
                let transport = self
                    .registry
                    .create_transport(&room_id, &peer_id, TransportDirection::Consumer)
                    .await?;
                Ok(ServerMessage::ConsumerTransportCreated(
                    TransportParams::from(&transport),
                ))
            }

            ClientMessage::ConnectProducerTransport {
                transport_id,
                dtls_parameters,
            } => {
                let room_id = self.current_room()?;
                self.registry
                    .connect_transport(
                        &room_id,
                        &peer_id,
                        &transport_id,
                        TransportDirection::Producer,
                        dtls_parameters,
                    )
                    .await?;
                Ok(ServerMessage::ProducerTransportConnected { transport_id })
            }

            ClientMessage::ConnectConsumerTransport {
                transport_id,
                dtls_parameters,
            } => {
                let room_id = self.current_room()?;
                self.registry
                    .connect_transport(
                        &room_id,
                        &peer_id,
                        &transport_id,
                        TransportDirection::Consumer,
                        dtls_parameters,
                    )
                    .await?;
                Ok(ServerMessage::ConsumerTransportConnected { transport_id })
            }

            ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
            } => {
                let room_id = self.current_room()?;
                let options = ProducerOptions::new(kind, rtp_parameters).app_data(app_data);
                let producer = self
                    .registry
                    .produce(&room_id, &peer_id, &transport_id, options)
                    .await?;
                Ok(ServerMessage::Produced { id: producer.id() })
            }

            ClientMessage::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                let room_id = self.current_room()?;
                let consumer = self
                    .registry
                    .consume(
                        &room_id,
                        &peer_id,
                        &transport_id,
                        &producer_id,
                        rtp_capabilities.as_ref(),
                    )
                    .await?;
                Ok(ServerMessage::Consumed {
                    id: consumer.id(),
                    producer_id,
                    kind: consumer.kind(),
                    rtp_parameters: consumer.rtp_parameters().clone(),
                    consumer_type: CONSUMER_TYPE,
                    producer_paused: consumer.producer_paused(),
                })
            }

            ClientMessage::PauseProducer { producer_id } => {
                let room_id = self.current_room()?;
                self.registry
                    .set_producer_paused(&room_id, &peer_id, &producer_id, true)
                    .await?;
                Ok(ServerMessage::ProducerPaused {
                    producer_id,
                    peer_id,
                })
            }

            ClientMessage::ResumeProducer { producer_id } => {
                let room_id = self.current_room()?;
                self.registry
                    .set_producer_paused(&room_id, &peer_id, &producer_id, false)
                    .await?;
                Ok(ServerMessage::ProducerResumed {
                    producer_id,
                    peer_id,
                })
            }

            ClientMessage::PauseConsumer { consumer_id } => {
                let room_id = self.current_room()?;
                self.registry
                    .set_consumer_paused(&room_id, &peer_id, &consumer_id, true)
                    .await?;
                Ok(ServerMessage::ConsumerPaused { consumer_id })
            }

            ClientMessage::ResumeConsumer { consumer_id } => {
                let room_id = self.current_room()?;
                self.registry
                    .set_consumer_paused(&room_id, &peer_id, &consumer_id, false)
                    .await?;
                Ok(ServerMessage::ConsumerResumed { consumer_id })
            }

            ClientMessage::CloseProducer { producer_id } => {
                let room_id = self.current_room()?;
                self.registry
                    .close_producer(&room_id, &peer_id, &producer_id)
                    .await?;
                Ok(ServerMessage::ProducerClosed { producer_id })
            }

            ClientMessage::CloseTransport { transport_id } => {
                let room_id = self.current_room()?;
                self.registry
                    .close_transport(&room_id, &peer_id, &transport_id)
                    .await?;
                Ok(ServerMessage::TransportClosed { transport_id })
            }

            ClientMessage::ChatMessage {
                message,
                message_type,
            } => {
                let room_id = self.current_room()?;
                if message.trim().is_empty() {
                    return Err(Error::InvalidMessage("empty chat message".into()));
                }
                if message.chars().count() > MAX_CHAT_LENGTH {
                    return Err(Error::InvalidMessage(format!(
                        "chat message longer than {MAX_CHAT_LENGTH} characters"
                    )));
                }
                let chat = self
                    .registry
                    .send_chat(&room_id, &peer_id, message, message_type)
                    .await?;
                Ok(ServerMessage::ChatMessage(chat))
            }

            ClientMessage::LeaveRoom => {
                let room_id = self.state.leave().ok_or(Error::NotJoined)?;
                self.registry.remove_peer(&room_id, &peer_id).await;
                Ok(ServerMessage::RoomLeft { room_id })
            }

            ClientMessage::GetStats => {
                self.current_room()?;
                let stats = self
                    .monitor
                    .get_connection_stats(&peer_id)
                    .await
                    .ok_or(Error::NotJoined)?;
                Ok(ServerMessage::ConnectionStats(stats))
            }
        }
    }

    fn current_room(&self) -> Result<String> {
        self.state
            .room_id()
            .map(str::to_string)
            .ok_or(Error::NotJoined)
    }

    /// Room named by the request, falling back to the joined room
    fn target_room(&self, requested: Option<String>) -> Result<String> {
        match requested {
            Some(room_id) => Ok(room_id),
            None => self.current_room(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::engine::{WebRtcTransportConfig, WorkerPool, WorkerSettings};
    use crate::media::default_media_codecs;
    use crate::registry::RegistryConfig;
    use crate::session::SessionPhase;
    use crate::stats::MonitorConfig;

    fn services() -> (Arc<RoomRegistry>, Arc<QualityMonitor>) {
        let settings = WorkerSettings::default()
            .num_workers(1)
            .port_range(44_000, 44_099);
        let pool = Arc::new(WorkerPool::create(&settings).unwrap());
        let registry = Arc::new(RoomRegistry::new(
            pool,
            default_media_codecs(),
            WebRtcTransportConfig::default(),
            RegistryConfig::default(),
        ));
        let monitor = Arc::new(QualityMonitor::new(
            Arc::clone(&registry),
            MonitorConfig::default(),
        ));
        (registry, monitor)
    }

    fn session(
        registry: &Arc<RoomRegistry>,
        monitor: &Arc<QualityMonitor>,
        peer_id: &str,
    ) -> (SignalingSession, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = SignalingSession::new(
            peer_id,
            None,
            Arc::clone(registry),
            Arc::clone(monitor),
            tx,
        );
        (session, rx)
    }

    #[tokio::test]
    async fn test_requests_before_join() {
        let (registry, monitor) = services();
        let (mut session, _rx) = session(&registry, &monitor, "a");

        let response = session
            .handle(ClientMessage::CreateProducerTransport { room_id: None })
            .await;
        assert!(matches!(
            response,
            ServerMessage::Error { ref error } if error.code == "NOT_JOINED"
        ));

        let response = session.handle(ClientMessage::LeaveRoom).await;
        assert!(response.is_error());
        assert_eq!(session.state().failed_requests, 2);
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let (registry, monitor) = services();
        let (mut session, _rx) = session(&registry, &monitor, "a");

        let response = session
            .handle(ClientMessage::JoinRoom {
                room_id: "room-1".into(),
                rtp_capabilities: None,
            })
            .await;
        match response {
            ServerMessage::RouterRtpCapabilities {
                rtp_capabilities,
                producers,
            } => {
                assert!(!rtp_capabilities.codecs.is_empty());
                assert!(producers.is_empty());
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(session.state().phase, SessionPhase::Joined);

        let response = session.handle(ClientMessage::LeaveRoom).await;
        assert_eq!(
            response,
            ServerMessage::RoomLeft {
                room_id: "room-1".into()
            }
        );
        assert!(!registry.room_exists("room-1").await);
    }

    #[tokio::test]
    async fn test_create_transport_for_foreign_room() {
        let (registry, monitor) = services();
        let (mut a, _rx_a) = session(&registry, &monitor, "a");
        let (mut b, _rx_b) = session(&registry, &monitor, "b");

        a.handle(ClientMessage::JoinRoom {
            room_id: "room-1".into(),
            rtp_capabilities: None,
        })
        .await;
        b.handle(ClientMessage::JoinRoom {
            room_id: "room-2".into(),
            rtp_capabilities: None,
        })
        .await;

        let response = b
            .handle(ClientMessage::CreateConsumerTransport {
                room_id: Some("room-1".into()),
            })
            .await;
        assert!(matches!(
            response,
            ServerMessage::Error { ref error } if error.code == "PEER_NOT_FOUND"
        ));

        let response = b
            .handle(ClientMessage::CreateConsumerTransport {
                room_id: Some("room-9".into()),
            })
            .await;
        assert!(matches!(
            response,
            ServerMessage::Error { ref error } if error.code == "ROOM_NOT_FOUND"
        ));
    }

    #[tokio::test]
    async fn test_bad_frame_keeps_session() {
        let (registry, monitor) = services();
        let (mut session, _rx) = session(&registry, &monitor, "a");

        let response = session.handle_text("{\"type\":\"join-room\"").await;
        assert!(matches!(
            response,
            ServerMessage::Error { ref error } if error.code == "INVALID_MESSAGE"
        ));

        let response = session
            .handle_text(r#"{"type":"join-room","data":{"roomId":"room-1"}}"#)
            .await;
        assert!(!response.is_error());
        assert_eq!(session.state().requests, 2);
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer() {
        let (registry, monitor) = services();
        let (mut a, _rx_a) = session(&registry, &monitor, "a");
        let (mut b, mut rx_b) = session(&registry, &monitor, "b");

        for s in [&mut a, &mut b] {
            s.handle(ClientMessage::JoinRoom {
                room_id: "room-1".into(),
                rtp_capabilities: None,
            })
            .await;
        }

        a.disconnect().await;
        assert_eq!(a.state().phase, SessionPhase::Closed);
        assert_eq!(registry.room_stats("room-1").await.unwrap().peer_count, 1);
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            Notification::PeerLeft { peer_id } if peer_id == "a"
        ));

        b.disconnect().await;
        assert!(!registry.room_exists("room-1").await);
    }

    #[tokio::test]
    async fn test_room_closed_notification_leaves_room() {
        let (registry, monitor) = services();
        let (mut session, mut rx) = session(&registry, &monitor, "a");

        session
            .handle(ClientMessage::JoinRoom {
                room_id: "room-1".into(),
                rtp_capabilities: None,
            })
            .await;
        assert!(registry.close_room("room-1").await);

        let message = session.notification(rx.try_recv().unwrap());
        assert_eq!(
            message,
            ServerMessage::RoomClosed {
                room_id: "room-1".into()
            }
        );
        assert!(!session.state().is_joined());
        assert!(session.handle(ClientMessage::LeaveRoom).await.is_error());
    }

    #[tokio::test]
    async fn test_get_stats() {
        let (registry, monitor) = services();
        let (mut session, _rx) = session(&registry, &monitor, "a");

        assert!(session.handle(ClientMessage::GetStats).await.is_error());

        session
            .handle(ClientMessage::JoinRoom {
                room_id: "room-1".into(),
                rtp_capabilities: None,
            })
            .await;
        let response = session.handle(ClientMessage::GetStats).await;
        assert!(matches!(response, ServerMessage::ConnectionStats(_)));
    }

    #[tokio::test]
    async fn test_chat_is_checked_and_echoed() {
        let (registry, monitor) = services();
        let (mut a, _rx_a) = session(&registry, &monitor, "a");
        let (mut b, mut rx_b) = session(&registry, &monitor, "b");

        let chat = |message: &str| ClientMessage::ChatMessage {
            message: message.into(),
            message_type: "text".into(),
        };
        assert!(a.handle(chat("early")).await.is_error());

        for s in [&mut a, &mut b] {
            s.handle(ClientMessage::JoinRoom {
                room_id: "room-1".into(),
                rtp_capabilities: None,
            })
            .await;
        }

        for bad in ["   ".to_string(), "x".repeat(MAX_CHAT_LENGTH + 1)] {
            assert!(matches!(
                a.handle(chat(&bad)).await,
                ServerMessage::Error { ref error } if error.code == "INVALID_MESSAGE"
            ));
        }
        assert!(rx_b.try_recv().is_err());

        let echoed = match a.handle(chat("hello")).await {
            ServerMessage::ChatMessage(message) => message,
            other => panic!("unexpected response {:?}", other),
        };
        assert_eq!(echoed.sender_id, "a");
        assert_eq!(echoed.session_id, "room-1");
        assert_eq!(
            b.notification(rx_b.try_recv().unwrap()),
            ServerMessage::ChatMessage(echoed)
        );
    }

    #[tokio::test]
    async fn test_join_rejects_out_of_range_payload_types() {
        let (registry, monitor) = services();
        let (mut session, _rx) = session(&registry, &monitor, "a");

        let mut caps = crate::media::router_capabilities(&default_media_codecs()).unwrap();
        caps.codecs[0].preferred_payload_type = Some(200);
        let response = session
            .handle(ClientMessage::JoinRoom {
                room_id: "room-1".into(),
                rtp_capabilities: Some(caps),
            })
            .await;
        assert!(matches!(
            response,
            ServerMessage::Error { ref error } if error.code == "INVALID_RTP_PARAMETERS"
        ));
        assert!(!session.state().is_joined());
        assert!(!registry.room_exists("room-1").await);
    }
}
