//! In-process media engine
//!
//! Object model mirrors a classic SFU:
//! - `WorkerPool` owns N `Worker`s, each with its own RTC port range
//! - a `Router` lives on one worker and switches media for one room
//! - a `WebRtcTransport` is one client endpoint on a router
//! - `Producer`s receive tracks and `Consumer`s deliver them
//!
//! Every handle is cheap to clone. Media flows from a producer to its
//! consumers over a broadcast relay; closing a producer ends every consumer
//! reading from it.

pub mod config;
pub mod consumer;
pub mod id;
pub mod pool;
pub mod producer;
pub mod router;
mod socket;
pub mod transport;
pub mod worker;

pub use config::{ListenIp, WebRtcTransportConfig, WorkerSettings};
pub use consumer::{Consumer, ConsumerStats};
pub use id::{ConsumerId, ProducerId, RouterId, TransportId};
pub use pool::{WorkerDeath, WorkerPool};
pub use producer::{Producer, ProducerOptions, ProducerStats, Resolution};
pub use router::Router;
pub use transport::{
    DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate, IceParameters,
    SctpParameters, WebRtcTransport,
};
pub use worker::{Worker, WorkerDump};
