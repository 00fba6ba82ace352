//! Signaling server
//!
//! Accepts WebSocket connections and drives one signaling session per
//! connection against the shared room registry.

pub mod config;
pub mod connection;
pub mod listener;

pub use config::ServerConfig;
pub use listener::SfuServer;
