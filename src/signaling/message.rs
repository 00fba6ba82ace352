//! Signaling wire format
//!
//! Every frame is a JSON object `{"type": "<name>", "data": {...}}` with a
//! kebab-case type name and camelCase fields. Requests that carry nothing
//! may omit `data`.

use serde::{Deserialize, Serialize};

use crate::engine::{
    ConsumerId, DtlsParameters, IceCandidate, IceParameters, ProducerId, SctpParameters,
    TransportId, WebRtcTransport,
};
use crate::error::{Error, Result};
use crate::media::{MediaKind, RtpCapabilities, RtpParameters};
use crate::registry::{ChatMessage, Notification, PeerId, ProducerInfo, RoomId};
use crate::stats::{ConnectionStats, QualityWarning};

/// Client to server request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    JoinRoom {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rtp_capabilities: Option<RtpCapabilities>,
    },
    CreateProducerTransport {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },
    ConnectProducerTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: serde_json::Value,
    },
    CreateConsumerTransport {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },
    ConnectConsumerTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        /// Falls back to the capabilities given when joining
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rtp_capabilities: Option<RtpCapabilities>,
    },
    PauseProducer {
        producer_id: ProducerId,
    },
    ResumeProducer {
        producer_id: ProducerId,
    },
    PauseConsumer {
        consumer_id: ConsumerId,
    },
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
    CloseProducer {
        producer_id: ProducerId,
    },
    CloseTransport {
        transport_id: TransportId,
    },
    ChatMessage {
        message: String,
        #[serde(rename = "type", default = "default_chat_type")]
        message_type: String,
    },
    LeaveRoom,
    GetStats,
}

fn default_chat_type() -> String {
    "text".into()
}

impl ClientMessage {
    /// Decode a text frame
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::InvalidMessage(e.to_string()))
    }

    /// Wire name of the request, for logging
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::CreateProducerTransport { .. } => "create-producer-transport",
            ClientMessage::ConnectProducerTransport { .. } => "connect-producer-transport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::CreateConsumerTransport { .. } => "create-consumer-transport",
            ClientMessage::ConnectConsumerTransport { .. } => "connect-consumer-transport",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::PauseProducer { .. } => "pause-producer",
            ClientMessage::ResumeProducer { .. } => "resume-producer",
            ClientMessage::PauseConsumer { .. } => "pause-consumer",
            ClientMessage::ResumeConsumer { .. } => "resume-consumer",
            ClientMessage::CloseProducer { .. } => "close-producer",
            ClientMessage::CloseTransport { .. } => "close-transport",
            ClientMessage::ChatMessage { .. } => "chat-message",
            ClientMessage::LeaveRoom => "leave-room",
            ClientMessage::GetStats => "get-stats",
        }
    }
}

/// What a client needs to negotiate a transport
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<SctpParameters>,
}

impl From<&WebRtcTransport> for TransportParams {
    fn from(transport: &WebRtcTransport) -> Self {
        Self {
            id: transport.id(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().to_vec(),
            dtls_parameters: transport.dtls_parameters().clone(),
            sctp_parameters: transport.sctp_parameters().cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: &'static str,
}

/// Server to client response or notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    RouterRtpCapabilities {
        rtp_capabilities: RtpCapabilities,
        producers: Vec<ProducerInfo>,
    },
    ProducerTransportCreated(TransportParams),
    ProducerTransportConnected {
        transport_id: TransportId,
    },
    Produced {
        id: ProducerId,
    },
    NewProducer {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
    },
    ConsumerTransportCreated(TransportParams),
    ConsumerTransportConnected {
        transport_id: TransportId,
    },
    Consumed {
        id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(rename = "type")]
        consumer_type: &'static str,
        producer_paused: bool,
    },
    /// Sent to the owner as a response and to its consumers' owners
    ProducerPaused {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    ProducerResumed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    ConsumerPaused {
        consumer_id: ConsumerId,
    },
    ConsumerResumed {
        consumer_id: ConsumerId,
    },
    ProducerClosed {
        producer_id: ProducerId,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    TransportClosed {
        transport_id: TransportId,
    },
    RoomLeft {
        room_id: RoomId,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    RoomClosed {
        room_id: RoomId,
    },
    ChatMessage(ChatMessage),
    QualityWarning(QualityWarning),
    ConnectionStats(ConnectionStats),
    Error {
        error: ErrorBody,
    },
}

impl ServerMessage {
    pub fn error(error: &Error) -> Self {
        ServerMessage::Error {
            error: ErrorBody {
                message: error.to_string(),
                code: error.code(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ServerMessage::Error { .. })
    }

    /// Encode as a text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Notification> for ServerMessage {
    fn from(notification: Notification) -> Self {
        match notification {
            Notification::NewProducer {
                producer_id,
                peer_id,
                kind,
            } => ServerMessage::NewProducer {
                producer_id,
                peer_id,
                kind,
            },
            Notification::ConsumerClosed {
                consumer_id,
                producer_id,
            } => ServerMessage::ConsumerClosed {
                consumer_id,
                producer_id,
            },
            Notification::TransportClosed { transport_id } => {
                ServerMessage::TransportClosed { transport_id }
            }
            Notification::PeerLeft { peer_id } => ServerMessage::PeerLeft { peer_id },
            Notification::RoomClosed { room_id } => ServerMessage::RoomClosed { room_id },
            Notification::ProducerPaused {
                producer_id,
                peer_id,
            } => ServerMessage::ProducerPaused {
                producer_id,
                peer_id,
            },
            Notification::ProducerResumed {
                producer_id,
                peer_id,
            } => ServerMessage::ProducerResumed {
                producer_id,
                peer_id,
            },
            Notification::ChatMessage(message) => ServerMessage::ChatMessage(message),
            Notification::QualityWarning(warning) => ServerMessage::QualityWarning(warning),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_join_room() {
        let text = r#"{"type":"join-room","data":{"roomId":"room-1"}}"#;
        let message = ClientMessage::parse(text).unwrap();
        assert_eq!(
            message,
            ClientMessage::JoinRoom {
                room_id: "room-1".into(),
                rtp_capabilities: None,
            }
        );
        assert_eq!(message.name(), "join-room");
    }

    #[test]
    fn test_parse_without_data() {
        let message = ClientMessage::parse(r#"{"type":"leave-room"}"#).unwrap();
        assert_eq!(message, ClientMessage::LeaveRoom);

        let message = ClientMessage::parse(r#"{"type":"get-stats","data":null}"#).unwrap();
        assert_eq!(message, ClientMessage::GetStats);
    }

    #[test]
    fn test_parse_connect() {
        let transport_id = TransportId::new();
        let text = json!({
            "type": "connect-producer-transport",
            "data": {
                "transportId": transport_id,
                "dtlsParameters": {
                    "role": "client",
                    "fingerprints": [{"algorithm": "sha-256", "value": "AB:CD"}]
                }
            }
        })
        .to_string();

        match ClientMessage::parse(&text).unwrap() {
            ClientMessage::ConnectProducerTransport {
                transport_id: id,
                dtls_parameters,
            } => {
                assert_eq!(id, transport_id);
                assert_eq!(dtls_parameters.fingerprints.len(), 1);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for text in [
            "not json",
            r#"{"type":"teleport"}"#,
            r#"{"type":"pause-producer","data":{"producerId":"nope"}}"#,
            r#"{"data":{}}"#,
        ] {
            assert!(matches!(
                ClientMessage::parse(text),
                Err(Error::InvalidMessage(_))
            ));
        }
    }

    #[test]
    fn test_error_shape() {
        let message = ServerMessage::error(&Error::RoomNotFound("room-9".into()));
        assert!(message.is_error());

        let value: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["error"]["code"], "ROOM_NOT_FOUND");
        assert_eq!(value["data"]["error"]["message"], "room not found: room-9");
    }

    #[test]
    fn test_notification_shape() {
        let producer_id = ProducerId::new();
        let message = ServerMessage::from(Notification::NewProducer {
            producer_id,
            peer_id: "a".into(),
            kind: MediaKind::Video,
        });

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "new-producer",
                "data": {
                    "producerId": producer_id,
                    "peerId": "a",
                    "kind": "video"
                }
            })
        );
    }

    #[test]
    fn test_parse_chat_message() {
        let message =
            ClientMessage::parse(r#"{"type":"chat-message","data":{"sessionId":"room-1","message":"hi"}}"#)
                .unwrap();
        assert_eq!(
            message,
            ClientMessage::ChatMessage {
                message: "hi".into(),
                message_type: "text".into(),
            }
        );

        let message = ClientMessage::parse(
            r#"{"type":"chat-message","data":{"message":"bp 120/80","type":"vitals"}}"#,
        )
        .unwrap();
        assert!(matches!(message, ClientMessage::ChatMessage { message_type, .. } if message_type == "vitals"));
    }

    #[test]
    fn test_chat_message_shape() {
        let chat = ChatMessage {
            id: "m-1".into(),
            session_id: "room-1".into(),
            sender_id: "a".into(),
            message: "hi".into(),
            message_type: "text".into(),
            timestamp: 1_700_000_000_000,
        };

        let value = serde_json::to_value(ServerMessage::from(Notification::ChatMessage(chat))).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "chat-message",
                "data": {
                    "id": "m-1",
                    "sessionId": "room-1",
                    "senderId": "a",
                    "message": "hi",
                    "type": "text",
                    "timestamp": 1_700_000_000_000u64
                }
            })
        );
    }

    #[test]
    fn test_consume_capabilities_are_optional() {
        let text = json!({
            "type": "consume",
            "data": {"transportId": TransportId::new(), "producerId": ProducerId::new()}
        })
        .to_string();
        assert!(matches!(
            ClientMessage::parse(&text).unwrap(),
            ClientMessage::Consume { rtp_capabilities: None, .. }
        ));
    }

    #[test]
    fn test_consumed_carries_type() {
        let message = ServerMessage::Consumed {
            id: ConsumerId::new(),
            producer_id: ProducerId::new(),
            kind: MediaKind::Audio,
            rtp_parameters: crate::media::codec::tests::opus_parameters(),
            consumer_type: "simple",
            producer_paused: false,
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "consumed");
        assert_eq!(value["data"]["type"], "simple");
        assert_eq!(value["data"]["producerPaused"], false);
        assert!(value["data"]["rtpParameters"]["codecs"].is_array());
    }
}
