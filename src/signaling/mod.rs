//! Signaling protocol
//!
//! JSON messages exchanged with clients over the WebSocket control channel,
//! and the per-connection handler that applies them to the room registry.
//!
//! ```text
//! client                       server
//!   │ join-room ───────────────► │
//!   │ ◄──────── router-rtp-capabilities
//!   │ create-producer-transport ►│
//!   │ ◄──── producer-transport-created
//!   │ connect-producer-transport►│
//!   │ produce ──────────────────►│ ──► new-producer (other peers)
//!   │ ◄─────────────── produced  │
//! ```

pub mod handler;
pub mod message;

pub use handler::SignalingSession;
pub use message::{ClientMessage, ErrorBody, ServerMessage, TransportParams};
