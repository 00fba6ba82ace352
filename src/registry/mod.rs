//! Room registry
//!
//! The registry maps room ids to rooms. A room is created on the first join
//! for an unseen id and torn down the moment its last peer leaves.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<RoomRegistry>
//!               ┌───────────────────────────────┐
//!               │ rooms: HashMap<RoomId,        │
//!               │   Mutex<Room {                │
//!               │     router,                   │
//!               │     peers, transports,        │
//!               │     producers, consumers,     │
//!               │   }>                          │
//!               │ >                             │
//!               └───────────────┬───────────────┘
//!                               │
//!         ┌─────────────────────┼─────────────────────┐
//!         │                     │                     │
//!         ▼                     ▼                     ▼
//!   [Signaling A]         [Signaling B]        [Quality monitor]
//!   produce() ──► new-producer ──► consume()   peer_media()
//! ```
//!
//! # Locking
//!
//! The map lock is only held to find or insert a room entry. Everything
//! that touches a room, including awaits on the media engine, happens under
//! that room's own mutex, so rooms never wait on each other.

pub mod config;
pub mod room;
pub mod store;

pub use config::RegistryConfig;
pub use room::{
    ChatMessage, Notification, Notifier, Peer, PeerId, ProducerInfo, Room, RoomId,
    TransportDirection,
};
pub use store::{JoinedRoom, PeerMedia, RoomRegistry};
