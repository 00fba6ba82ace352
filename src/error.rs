//! Error types
//!
//! Operation-scoped errors are reported back to the connection that caused
//! them. `WorkerFatal` is the only error that takes the whole service down.

use crate::engine::{ConsumerId, ProducerId, RouterId, TransportId};

/// Error type for all SFU operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Referenced room has no active peers
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Peer is not a member of the room
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Transport id is unknown, already closed, or owned by another peer
    #[error("transport not found: {0}")]
    TransportNotFound(TransportId),

    /// Producer id is unknown or already closed
    #[error("producer not found: {0}")]
    ProducerNotFound(ProducerId),

    /// Consumer id is unknown or already closed
    #[error("consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    /// Requesting peer cannot decode what the producer sends
    #[error("rtp capabilities are not compatible with producer {0}")]
    IncompatibleCapabilities(ProducerId),

    /// Codec is not in the router's capabilities
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Malformed RTP parameters in a produce request
    #[error("invalid rtp parameters: {0}")]
    InvalidRtpParameters(String),

    /// Transport has not completed its DTLS connect yet
    #[error("transport not connected: {0}")]
    TransportNotConnected(TransportId),

    /// Transport was already connected with different DTLS parameters
    #[error("transport already connected: {0}")]
    TransportAlreadyConnected(TransportId),

    /// Remote DTLS parameters were rejected
    #[error("invalid dtls parameters: {0}")]
    InvalidDtlsParameters(String),

    /// Signaling request that needs a room arrived before join-room
    #[error("peer has not joined a room")]
    NotJoined,

    /// Router was closed while the request was in flight
    #[error("router closed: {0}")]
    RouterClosed(RouterId),

    /// Worker has no free port left in its range
    #[error("no free port left on worker {0}")]
    PortsExhausted(usize),

    /// A media worker terminated unexpectedly
    #[error("media worker {0} died")]
    WorkerFatal(usize),

    /// Signaling frame could not be decoded
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Configuration is invalid
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether the error must take the process down
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::WorkerFatal(_))
    }

    /// Stable code sent to clients alongside the message
    pub fn code(&self) -> &'static str {
        match self {
            Error::RoomNotFound(_) => "ROOM_NOT_FOUND",
            Error::PeerNotFound(_) => "PEER_NOT_FOUND",
            Error::TransportNotFound(_) => "TRANSPORT_NOT_FOUND",
            Error::ProducerNotFound(_) => "PRODUCER_NOT_FOUND",
            Error::ConsumerNotFound(_) => "CONSUMER_NOT_FOUND",
            Error::IncompatibleCapabilities(_) => "INCOMPATIBLE_CAPABILITIES",
            Error::UnsupportedCodec(_) => "UNSUPPORTED_CODEC",
            Error::InvalidRtpParameters(_) => "INVALID_RTP_PARAMETERS",
            Error::TransportNotConnected(_) => "TRANSPORT_NOT_CONNECTED",
            Error::TransportAlreadyConnected(_) => "TRANSPORT_ALREADY_CONNECTED",
            Error::InvalidDtlsParameters(_) => "INVALID_DTLS_PARAMETERS",
            Error::NotJoined => "NOT_JOINED",
            Error::RouterClosed(_) => "ROUTER_CLOSED",
            Error::PortsExhausted(_) => "PORTS_EXHAUSTED",
            Error::WorkerFatal(_) => "WORKER_FATAL",
            Error::InvalidMessage(_) | Error::Json(_) => "INVALID_MESSAGE",
            Error::Config(_) | Error::Toml(_) => "CONFIG",
            Error::Io(_) | Error::WebSocket(_) => "INTERNAL",
        }
    }
}

/// Result type for SFU operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_worker_death_is_fatal() {
        assert!(Error::WorkerFatal(0).is_fatal());
        assert!(!Error::RoomNotFound("room-1".into()).is_fatal());
        assert!(!Error::NotJoined.is_fatal());
    }

    #[test]
    fn test_codes() {
        let id = ProducerId::new();
        assert_eq!(
            Error::IncompatibleCapabilities(id).code(),
            "INCOMPATIBLE_CAPABILITIES"
        );
        assert_eq!(Error::TransportNotFound(TransportId::new()).code(), "TRANSPORT_NOT_FOUND");
        assert!(Error::ProducerNotFound(id).to_string().contains(&id.to_string()));
    }
}
