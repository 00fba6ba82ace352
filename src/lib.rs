//! telemed-sfu: selective forwarding media server for telemedicine calls
//!
//! Clients talk to the server over a WebSocket signaling channel. Each call
//! is a room with one router; peers open send and receive transports,
//! publish tracks as producers and subscribe to each other's tracks as
//! consumers. Media is relayed, never mixed or transcoded.
//!
//! # Quick start
//!
//! ```no_run
//! use telemed_sfu::{SfuConfig, SfuServer};
//!
//! #[tokio::main]
//! async fn main() -> telemed_sfu::Result<()> {
//!     let server = SfuServer::new(SfuConfig::default())?;
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! # Layout
//!
//! - [`engine`]: workers, routers, transports, producers and consumers
//! - [`registry`]: rooms and peers, keyed by room id
//! - [`signaling`]: wire messages and the per-connection handler
//! - [`server`]: WebSocket listener
//! - [`stats`]: room counters and the connection quality monitor

pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod registry;
pub mod server;
pub mod session;
pub mod signaling;
pub mod stats;

pub use config::SfuConfig;
pub use error::{Error, Result};
pub use registry::{RoomRegistry, TransportDirection};
pub use server::{ServerConfig, SfuServer};
pub use signaling::{ClientMessage, ServerMessage, SignalingSession};
pub use stats::{ConnectionStats, QualityMonitor, QualityWarning, RoomStats};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
