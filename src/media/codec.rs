//! Codec configuration and capability negotiation
//!
//! Covers the three negotiation steps the router performs:
//! - deriving the router's RTP capabilities from the configured codec list
//! - validating what a producer declares it will send
//! - checking a consumer's decode capabilities against a producer and
//!   building the parameters the consumer will receive

use serde_json::json;

use crate::error::{Error, Result};

use super::rtp::{
    is_rtx, CodecParameters, MediaKind, RtcpFeedback, RtcpParameters, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension,
    RtpHeaderExtensionParameters, RtpParameters, RtxParameters,
};

/// First payload type handed out to codecs without a preferred one
const DYNAMIC_PAYLOAD_TYPE_START: u8 = 100;

/// Dynamic payload type range (RFC 3551)
const DYNAMIC_PAYLOAD_TYPES: std::ops::RangeInclusive<u8> = 96..=127;

/// The payload type field of an RTP header is 7 bits wide
const MAX_PAYLOAD_TYPE: u8 = 127;

/// Default H.264 profile-level-id (constrained baseline, level 3.1)
const DEFAULT_H264_PROFILE_LEVEL_ID: &str = "42e01f";

/// Codec set tuned for consultations: Opus with in-band FEC, VP8, H.264, VP9
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".into(),
            preferred_payload_type: None,
            clock_rate: 48_000,
            channels: Some(2),
            parameters: params(json!({"minptime": 10, "useinbandfec": 1})),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".into(),
            preferred_payload_type: None,
            clock_rate: 90_000,
            channels: None,
            parameters: params(json!({
                "x-google-start-bitrate": 1000,
                "x-google-min-bitrate": 500,
                "x-google-max-bitrate": 3000
            })),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".into(),
            preferred_payload_type: None,
            clock_rate: 90_000,
            channels: None,
            parameters: params(json!({
                "packetization-mode": 1,
                "profile-level-id": DEFAULT_H264_PROFILE_LEVEL_ID,
                "level-asymmetry-allowed": 1
            })),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP9".into(),
            preferred_payload_type: None,
            clock_rate: 90_000,
            channels: None,
            parameters: params(json!({"profile-id": 0})),
            rtcp_feedback: Vec::new(),
        },
    ]
}

fn params(value: serde_json::Value) -> CodecParameters {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => CodecParameters::new(),
    }
}

fn default_rtcp_feedback(kind: MediaKind) -> Vec<RtcpFeedback> {
    match kind {
        MediaKind::Audio => vec![RtcpFeedback::new("transport-cc", "")],
        MediaKind::Video => vec![
            RtcpFeedback::new("nack", ""),
            RtcpFeedback::new("nack", "pli"),
            RtcpFeedback::new("ccm", "fir"),
            RtcpFeedback::new("goog-remb", ""),
            RtcpFeedback::new("transport-cc", ""),
        ],
    }
}

fn default_header_extensions() -> Vec<RtpHeaderExtension> {
    let ext = |kind, uri: &str, id| RtpHeaderExtension {
        kind,
        uri: uri.to_string(),
        preferred_id: id,
    };

    vec![
        ext(None, "urn:ietf:params:rtp-hdrext:sdes:mid", 1),
        ext(
            Some(MediaKind::Video),
            "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
            2,
        ),
        ext(
            None,
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            4,
        ),
        ext(
            None,
            "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
            5,
        ),
        ext(
            Some(MediaKind::Audio),
            "urn:ietf:params:rtp-hdrext:ssrc-audio-level",
            10,
        ),
        ext(Some(MediaKind::Video), "urn:3gpp:video-orientation", 11),
    ]
}

/// Read a numeric codec parameter, accepting numbers and numeric strings
pub fn param_u64(parameters: &CodecParameters, key: &str) -> Option<u64> {
    match parameters.get(key)? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn param_string(parameters: &CodecParameters, key: &str) -> Option<String> {
    match parameters.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Kind implied by a MIME type's top-level type
pub fn kind_of(mime_type: &str) -> Option<MediaKind> {
    let top = mime_type.split('/').next()?;
    if top.eq_ignore_ascii_case("audio") {
        Some(MediaKind::Audio)
    } else if top.eq_ignore_ascii_case("video") {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// Common view over capabilities and negotiated codec parameters
pub trait CodecMatch {
    fn mime_type(&self) -> &str;
    fn clock_rate(&self) -> u32;
    fn channels(&self) -> Option<u8>;
    fn parameters(&self) -> &CodecParameters;
}

impl CodecMatch for RtpCodecCapability {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }
    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }
    fn channels(&self) -> Option<u8> {
        self.channels
    }
    fn parameters(&self) -> &CodecParameters {
        &self.parameters
    }
}

impl CodecMatch for RtpCodecParameters {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }
    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }
    fn channels(&self) -> Option<u8> {
        self.channels
    }
    fn parameters(&self) -> &CodecParameters {
        &self.parameters
    }
}

/// Whether two codecs describe the same decodable format
pub fn codecs_match(a: &impl CodecMatch, b: &impl CodecMatch) -> bool {
    if !a.mime_type().eq_ignore_ascii_case(b.mime_type()) || a.clock_rate() != b.clock_rate() {
        return false;
    }

    if kind_of(a.mime_type()) == Some(MediaKind::Audio)
        && a.channels().unwrap_or(1) != b.channels().unwrap_or(1)
    {
        return false;
    }

    let subtype = a.mime_type().rsplit('/').next().unwrap_or_default();

    if subtype.eq_ignore_ascii_case("h264") {
        let mode_a = param_u64(a.parameters(), "packetization-mode").unwrap_or(0);
        let mode_b = param_u64(b.parameters(), "packetization-mode").unwrap_or(0);
        if mode_a != mode_b {
            return false;
        }
        return h264_profile(a.parameters()) == h264_profile(b.parameters());
    }

    if subtype.eq_ignore_ascii_case("vp9") {
        let profile_a = param_u64(a.parameters(), "profile-id").unwrap_or(0);
        let profile_b = param_u64(b.parameters(), "profile-id").unwrap_or(0);
        return profile_a == profile_b;
    }

    true
}

/// profile_idc + profile_iop, the part of profile-level-id that must agree
fn h264_profile(parameters: &CodecParameters) -> String {
    let id = param_string(parameters, "profile-level-id")
        .unwrap_or_else(|| DEFAULT_H264_PROFILE_LEVEL_ID.to_string());
    id.chars().take(4).collect::<String>().to_ascii_lowercase()
}

/// Build router capabilities from the configured media codecs
///
/// Payload types are assigned from 100 upward unless a codec prefers one.
/// Every video codec gets a companion RTX entry.
pub fn router_capabilities(media_codecs: &[RtpCodecCapability]) -> Result<RtpCapabilities> {
    if media_codecs.is_empty() {
        return Err(Error::Config("router needs at least one media codec".into()));
    }

    let mut taken: Vec<u8> = Vec::new();
    for codec in media_codecs {
        if let Some(pt) = codec.preferred_payload_type {
            if !DYNAMIC_PAYLOAD_TYPES.contains(&pt) || taken.contains(&pt) {
                return Err(Error::Config(format!(
                    "invalid preferred payload type {} for {}",
                    pt, codec.mime_type
                )));
            }
            taken.push(pt);
        }
    }

    let mut pool = (DYNAMIC_PAYLOAD_TYPE_START..=*DYNAMIC_PAYLOAD_TYPES.end())
        .chain(*DYNAMIC_PAYLOAD_TYPES.start()..DYNAMIC_PAYLOAD_TYPE_START)
        .filter(|pt| !taken.contains(pt))
        .collect::<Vec<u8>>()
        .into_iter();
    let mut next_pt = |mime: &str| {
        pool.next()
            .ok_or_else(|| Error::Config(format!("no payload type left for {}", mime)))
    };

    let mut codecs = Vec::with_capacity(media_codecs.len() * 2);
    for codec in media_codecs {
        if is_rtx(&codec.mime_type) {
            return Err(Error::Config("rtx codecs are added automatically".into()));
        }
        if kind_of(&codec.mime_type) != Some(codec.kind) {
            return Err(Error::Config(format!(
                "codec {} does not match kind {}",
                codec.mime_type, codec.kind
            )));
        }

        let pt = match codec.preferred_payload_type {
            Some(pt) => pt,
            None => next_pt(&codec.mime_type)?,
        };

        let mut capability = codec.clone();
        capability.preferred_payload_type = Some(pt);
        if capability.rtcp_feedback.is_empty() {
            capability.rtcp_feedback = default_rtcp_feedback(codec.kind);
        }
        if codec.kind == MediaKind::Audio && capability.channels.is_none() {
            capability.channels = Some(1);
        }
        codecs.push(capability);

        if codec.kind == MediaKind::Video {
            codecs.push(RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/rtx".into(),
                preferred_payload_type: Some(next_pt("video/rtx")?),
                clock_rate: codec.clock_rate,
                channels: None,
                parameters: params(json!({ "apt": pt })),
                rtcp_feedback: Vec::new(),
            });
        }
    }

    Ok(RtpCapabilities {
        codecs,
        header_extensions: default_header_extensions(),
    })
}

/// Check the payload types a client declares in its capabilities
pub fn validate_rtp_capabilities(caps: &RtpCapabilities) -> Result<()> {
    for codec in &caps.codecs {
        if let Some(pt) = codec.preferred_payload_type {
            if pt > MAX_PAYLOAD_TYPE {
                return Err(Error::InvalidRtpParameters(format!(
                    "payload type {pt} of {} out of range",
                    codec.mime_type
                )));
            }
        }
        if is_rtx(&codec.mime_type) {
            if let Some(apt) = param_u64(&codec.parameters, "apt") {
                if apt > MAX_PAYLOAD_TYPE as u64 {
                    return Err(Error::InvalidRtpParameters(format!("rtx apt {apt} out of range")));
                }
            }
        }
    }
    Ok(())
}

/// Check what a producer declares against the router's capabilities
pub fn validate_producer_parameters(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
    router_caps: &RtpCapabilities,
) -> Result<()> {
    let codec = rtp_parameters
        .media_codec()
        .ok_or_else(|| Error::InvalidRtpParameters("no media codec".into()))?;

    if let Some(bad) = rtp_parameters.codecs.iter().find(|c| c.payload_type > MAX_PAYLOAD_TYPE) {
        return Err(Error::InvalidRtpParameters(format!(
            "payload type {} of {} out of range",
            bad.payload_type, bad.mime_type
        )));
    }

    if kind_of(&codec.mime_type) != Some(kind) {
        return Err(Error::InvalidRtpParameters(format!(
            "codec {} cannot carry {}",
            codec.mime_type, kind
        )));
    }

    let supported = router_caps
        .codecs
        .iter()
        .filter(|c| c.kind == kind && !is_rtx(&c.mime_type))
        .any(|c| codecs_match(c, codec));

    if !supported {
        return Err(Error::UnsupportedCodec(codec.mime_type.clone()));
    }

    Ok(())
}

/// Find the capability in `caps` able to decode the producer's media codec
pub fn find_consumable_codec<'a>(
    producer_parameters: &RtpParameters,
    caps: &'a RtpCapabilities,
) -> Option<&'a RtpCodecCapability> {
    let codec = producer_parameters.media_codec()?;
    caps.codecs
        .iter()
        .filter(|c| !is_rtx(&c.mime_type))
        .find(|c| codecs_match(*c, codec))
}

/// Identifiers chosen by the transport for a new consumer
#[derive(Debug, Clone)]
pub struct ConsumerIdentity {
    pub mid: String,
    pub ssrc: u32,
    pub rtx_ssrc: u32,
}

/// Build the parameters a consumer receives, or `None` if it cannot decode
pub fn consumer_parameters(
    producer_parameters: &RtpParameters,
    caps: &RtpCapabilities,
    identity: ConsumerIdentity,
) -> Option<RtpParameters> {
    let source = producer_parameters.media_codec()?;
    let matched = find_consumable_codec(producer_parameters, caps)?;
    let payload_type = matched.preferred_payload_type.unwrap_or(source.payload_type);

    let mut codecs = vec![RtpCodecParameters {
        mime_type: matched.mime_type.clone(),
        payload_type,
        clock_rate: matched.clock_rate,
        channels: matched.channels,
        parameters: source.parameters.clone(),
        rtcp_feedback: matched.rtcp_feedback.clone(),
    }];

    let rtx = caps.codecs.iter().find(|c| {
        is_rtx(&c.mime_type) && param_u64(&c.parameters, "apt") == Some(payload_type as u64)
    });
    // Without a preferred type RTX takes the next one, if that is still dynamic
    let rtx = rtx.and_then(|rtx| {
        let pt = rtx.preferred_payload_type.or_else(|| {
            payload_type
                .checked_add(1)
                .filter(|pt| DYNAMIC_PAYLOAD_TYPES.contains(pt))
        })?;
        Some((rtx, pt))
    });
    if let Some((rtx, rtx_payload_type)) = rtx {
        codecs.push(RtpCodecParameters {
            mime_type: rtx.mime_type.clone(),
            payload_type: rtx_payload_type,
            clock_rate: rtx.clock_rate,
            channels: None,
            parameters: rtx.parameters.clone(),
            rtcp_feedback: Vec::new(),
        });
    }

    let kind = kind_of(&matched.mime_type);
    let header_extensions = caps
        .header_extensions
        .iter()
        .filter(|ext| ext.kind.is_none() || ext.kind == kind)
        .filter(|ext| {
            producer_parameters
                .header_extensions
                .iter()
                .any(|p| p.uri == ext.uri)
        })
        .map(|ext| RtpHeaderExtensionParameters {
            uri: ext.uri.clone(),
            id: ext.preferred_id,
            encrypt: false,
        })
        .collect();

    let max_bitrate = producer_parameters
        .encodings
        .iter()
        .filter_map(|e| e.max_bitrate)
        .max();

    Some(RtpParameters {
        mid: Some(identity.mid),
        codecs,
        header_extensions,
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(identity.ssrc),
            rid: None,
            rtx: rtx.map(|_| RtxParameters {
                ssrc: identity.rtx_ssrc,
            }),
            max_bitrate,
            scalability_mode: None,
        }],
        rtcp: RtcpParameters {
            cname: producer_parameters.rtcp.cname.clone(),
            reduced_size: true,
        },
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".into()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".into(),
                payload_type: 96,
                clock_rate: 90_000,
                channels: None,
                parameters: CodecParameters::new(),
                rtcp_feedback: Vec::new(),
            }],
            header_extensions: vec![RtpHeaderExtensionParameters {
                uri: "urn:ietf:params:rtp-hdrext:sdes:mid".into(),
                id: 1,
                encrypt: false,
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1234),
                max_bitrate: Some(1_500_000),
                ..Default::default()
            }],
            rtcp: RtcpParameters {
                cname: Some("cname-a".into()),
                reduced_size: true,
            },
        }
    }

    pub(crate) fn opus_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("1".into()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".into(),
                payload_type: 111,
                clock_rate: 48_000,
                channels: Some(2),
                parameters: params(json!({"useinbandfec": 1})),
                rtcp_feedback: Vec::new(),
            }],
            header_extensions: Vec::new(),
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(5678),
                ..Default::default()
            }],
            rtcp: RtcpParameters::default(),
        }
    }

    #[test]
    fn test_router_capabilities_assign_payload_types() {
        let caps = router_capabilities(&default_media_codecs()).unwrap();

        // opus + 3 video codecs each with rtx
        assert_eq!(caps.codecs.len(), 7);
        assert_eq!(caps.codecs[0].mime_type, "audio/opus");
        assert_eq!(caps.codecs[0].preferred_payload_type, Some(100));
        assert_eq!(caps.codecs[1].mime_type, "video/VP8");
        assert_eq!(caps.codecs[1].preferred_payload_type, Some(101));
        assert_eq!(caps.codecs[2].mime_type, "video/rtx");
        assert_eq!(param_u64(&caps.codecs[2].parameters, "apt"), Some(101));
        assert!(!caps.codecs[1].rtcp_feedback.is_empty());
        assert!(!caps.header_extensions.is_empty());

        let mut pts: Vec<u8> = caps
            .codecs
            .iter()
            .filter_map(|c| c.preferred_payload_type)
            .collect();
        pts.sort_unstable();
        pts.dedup();
        assert_eq!(pts.len(), caps.codecs.len());
    }

    #[test]
    fn test_router_capabilities_rejects_bad_config() {
        assert!(router_capabilities(&[]).is_err());

        let mut codecs = default_media_codecs();
        codecs[0].kind = MediaKind::Video;
        assert!(router_capabilities(&codecs).is_err());

        let mut codecs = default_media_codecs();
        codecs[0].preferred_payload_type = Some(101);
        codecs[1].preferred_payload_type = Some(101);
        assert!(router_capabilities(&codecs).is_err());
    }

    #[test]
    fn test_h264_profile_matching() {
        let caps = router_capabilities(&default_media_codecs()).unwrap();
        let h264 = caps
            .codecs
            .iter()
            .find(|c| c.mime_type == "video/H264")
            .unwrap()
            .clone();

        let mut other = h264.clone();
        other
            .parameters
            .insert("profile-level-id".into(), json!("42e034"));
        assert!(codecs_match(&h264, &other));

        other
            .parameters
            .insert("profile-level-id".into(), json!("640032"));
        assert!(!codecs_match(&h264, &other));

        let mut mode0 = h264.clone();
        mode0.parameters.insert("packetization-mode".into(), json!(0));
        assert!(!codecs_match(&h264, &mode0));
    }

    #[test]
    fn test_audio_channel_mismatch() {
        let caps = router_capabilities(&default_media_codecs()).unwrap();
        let mut mono = opus_parameters();
        mono.codecs[0].channels = Some(1);

        assert!(find_consumable_codec(&opus_parameters(), &caps).is_some());
        assert!(find_consumable_codec(&mono, &caps).is_none());
    }

    #[test]
    fn test_validate_producer_parameters() {
        let caps = router_capabilities(&default_media_codecs()).unwrap();

        assert!(validate_producer_parameters(MediaKind::Video, &vp8_parameters(), &caps).is_ok());

        let result = validate_producer_parameters(MediaKind::Audio, &vp8_parameters(), &caps);
        assert!(matches!(result, Err(Error::InvalidRtpParameters(_))));

        let mut av1 = vp8_parameters();
        av1.codecs[0].mime_type = "video/AV1".into();
        let result = validate_producer_parameters(MediaKind::Video, &av1, &caps);
        assert!(matches!(result, Err(Error::UnsupportedCodec(_))));

        let empty = RtpParameters::default();
        let result = validate_producer_parameters(MediaKind::Video, &empty, &caps);
        assert!(matches!(result, Err(Error::InvalidRtpParameters(_))));

        let mut wide = vp8_parameters();
        wide.codecs[0].payload_type = 200;
        let result = validate_producer_parameters(MediaKind::Video, &wide, &caps);
        assert!(matches!(result, Err(Error::InvalidRtpParameters(_))));
    }

    /// Client capabilities with VP8 at 255 and an RTX entry pointing at it
    fn capabilities_at_255() -> RtpCapabilities {
        let mut caps = router_capabilities(&default_media_codecs()).unwrap();
        for codec in &mut caps.codecs {
            if codec.mime_type == "video/VP8" {
                codec.preferred_payload_type = Some(255);
            }
            if codec.mime_type == "video/rtx" {
                codec.preferred_payload_type = None;
                codec.parameters.insert("apt".into(), json!(255));
            }
        }
        caps
    }

    #[test]
    fn test_validate_rtp_capabilities() {
        let caps = router_capabilities(&default_media_codecs()).unwrap();
        assert!(validate_rtp_capabilities(&caps).is_ok());

        let result = validate_rtp_capabilities(&capabilities_at_255());
        assert!(matches!(result, Err(Error::InvalidRtpParameters(_))));

        let mut apt_only = caps.clone();
        for codec in &mut apt_only.codecs {
            if codec.mime_type == "video/rtx" {
                codec.parameters.insert("apt".into(), json!(300));
            }
        }
        assert!(validate_rtp_capabilities(&apt_only).is_err());
    }

    #[test]
    fn test_consumer_parameters_at_top_of_payload_range() {
        let identity = ConsumerIdentity {
            mid: "0".into(),
            ssrc: 42,
            rtx_ssrc: 43,
        };

        // Unvalidated capabilities must not overflow; RTX is left out
        let params = consumer_parameters(&vp8_parameters(), &capabilities_at_255(), identity.clone())
            .unwrap();
        assert_eq!(params.codecs.len(), 1);
        assert_eq!(params.codecs[0].payload_type, 255);

        let mut at_127 = router_capabilities(&default_media_codecs()).unwrap();
        for codec in &mut at_127.codecs {
            if codec.mime_type == "video/VP8" {
                codec.preferred_payload_type = Some(127);
            }
            if codec.mime_type == "video/rtx" {
                codec.preferred_payload_type = None;
                codec.parameters.insert("apt".into(), json!(127));
            }
        }
        let params = consumer_parameters(&vp8_parameters(), &at_127, identity).unwrap();
        assert_eq!(params.codecs.len(), 1);
    }

    #[test]
    fn test_consumer_parameters() {
        let caps = router_capabilities(&default_media_codecs()).unwrap();
        let identity = ConsumerIdentity {
            mid: "3".into(),
            ssrc: 42,
            rtx_ssrc: 43,
        };

        let params = consumer_parameters(&vp8_parameters(), &caps, identity).unwrap();
        assert_eq!(params.mid.as_deref(), Some("3"));
        assert_eq!(params.codecs[0].payload_type, 101);
        assert_eq!(params.codecs[1].mime_type, "video/rtx");
        assert_eq!(params.encodings[0].ssrc, Some(42));
        assert_eq!(params.encodings[0].rtx, Some(RtxParameters { ssrc: 43 }));
        assert_eq!(params.encodings[0].max_bitrate, Some(1_500_000));
        assert_eq!(params.rtcp.cname.as_deref(), Some("cname-a"));
        assert_eq!(params.header_extensions.len(), 1);
    }

    #[test]
    fn test_consumer_parameters_incompatible() {
        let audio_only = RtpCapabilities {
            codecs: default_media_codecs()
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
            header_extensions: Vec::new(),
        };
        let identity = ConsumerIdentity {
            mid: "0".into(),
            ssrc: 1,
            rtx_ssrc: 2,
        };

        assert!(consumer_parameters(&vp8_parameters(), &audio_only, identity).is_none());
    }
}
