//! Media descriptions shared by the engine and the signaling layer
//!
//! This module provides:
//! - RTP capability / parameter types as exchanged with WebRTC clients
//! - The default codec set and codec negotiation rules
//! - The relayed RTP packet type and wire parsing
//! - RTCP sender/receiver reports for round-trip measurement

pub mod codec;
pub mod packet;
pub mod rtcp;
pub mod rtp;

pub use codec::{default_media_codecs, router_capabilities};
pub use packet::{Datagram, RtpPacket};
pub use rtp::{
    MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters,
};
