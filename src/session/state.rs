//! Session state machine
//!
//! Tracks one signaling connection from connect to disconnect. Producing and
//! consuming are not phases of their own: once joined, a peer may hold any
//! number of producers and consumers at the same time.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Connection open, not in a room
    Connected,
    /// Member of a room
    Joined,
    /// Session is closing
    Closing,
    /// Session closed
    Closed,
}

/// Complete session state
#[derive(Debug)]
pub struct SessionState {
    /// Peer id assigned to the connection
    pub peer_id: String,

    /// Remote address, when known
    pub peer_addr: Option<SocketAddr>,

    /// Current phase
    pub phase: SessionPhase,

    /// Room the peer is in while `Joined`
    pub room_id: Option<String>,

    /// Connection start time
    pub connected_at: Instant,

    /// Time of the latest join
    pub joined_at: Option<Instant>,

    /// Signaling requests handled
    pub requests: u64,

    /// Requests that ended in an error response
    pub failed_requests: u64,

    last_activity: Instant,
}

impl SessionState {
    /// Create a new session state
    pub fn new(peer_id: impl Into<String>, peer_addr: Option<SocketAddr>) -> Self {
        let now = Instant::now();
        Self {
            peer_id: peer_id.into(),
            peer_addr,
            phase: SessionPhase::Connected,
            room_id: None,
            connected_at: now,
            joined_at: None,
            requests: 0,
            failed_requests: 0,
            last_activity: now,
        }
    }

    /// Enter a room, replacing any previous one
    pub fn join(&mut self, room_id: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        self.room_id = Some(room_id.into());
        self.joined_at = Some(Instant::now());
        self.phase = SessionPhase::Joined;
    }

    /// Leave the current room; returns the room that was left
    pub fn leave(&mut self) -> Option<String> {
        let room_id = self.room_id.take();
        if self.phase == SessionPhase::Joined {
            self.phase = SessionPhase::Connected;
        }
        room_id
    }

    /// Count a handled request
    pub fn record_request(&mut self, failed: bool) {
        self.requests += 1;
        if failed {
            self.failed_requests += 1;
        }
        self.last_activity = Instant::now();
    }

    /// Time since the last request
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Get session duration
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn is_joined(&self) -> bool {
        self.phase == SessionPhase::Joined
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed)
    }

    /// Start closing the session
    pub fn close(&mut self) {
        if self.phase != SessionPhase::Closed {
            self.phase = SessionPhase::Closing;
        }
    }

    /// Mark the session fully closed
    pub fn finish(&mut self) {
        self.room_id = None;
        self.phase = SessionPhase::Closed;
    }
}
