//! RTP packets relayed from producers to consumers

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed RTP header length
pub const RTP_HEADER_LEN: usize = 12;

/// What a datagram arriving on a media port carries (RFC 7983 demultiplexing)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram {
    Stun,
    Dtls,
    Rtp,
    Rtcp,
    Unknown,
}

impl Datagram {
    pub fn classify(buf: &[u8]) -> Self {
        let Some(&first) = buf.first() else {
            return Datagram::Unknown;
        };
        match first {
            0..=3 => Datagram::Stun,
            20..=63 => Datagram::Dtls,
            128..=191 if buf.len() >= 2 => {
                // RTCP packet types 192-223 (RFC 5761)
                if (192..=223).contains(&buf[1]) {
                    Datagram::Rtcp
                } else {
                    Datagram::Rtp
                }
            }
            _ => Datagram::Unknown,
        }
    }
}

/// An RTP packet as relayed by the router
///
/// Cheap to clone: the payload is reference counted, so every consumer of a
/// producer shares one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Set on the last packet of a video frame
    pub marker: bool,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32, payload: Bytes) -> Self {
        Self {
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            marker: false,
            payload,
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Size on the wire including the fixed 12 byte header
    pub fn size(&self) -> usize {
        RTP_HEADER_LEN + self.payload.len()
    }

    /// Parse an RTP packet (RFC 3550 section 5.1)
    ///
    /// CSRCs and header extensions are skipped and padding is stripped; the
    /// relayed packet keeps only the fixed header fields and the payload.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < RTP_HEADER_LEN {
            return None;
        }

        let mut buf = datagram;
        let first = buf.get_u8();
        if first >> 6 != 2 {
            return None;
        }
        let padding = first & 0x20 != 0;
        let extension = first & 0x10 != 0;
        let csrc_count = (first & 0x0f) as usize;

        let second = buf.get_u8();
        let marker = second & 0x80 != 0;
        let payload_type = second & 0x7f;
        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < csrc_count * 4 {
            return None;
        }
        buf.advance(csrc_count * 4);

        if extension {
            if buf.remaining() < 4 {
                return None;
            }
            let _profile = buf.get_u16();
            let words = buf.get_u16() as usize;
            if buf.remaining() < words * 4 {
                return None;
            }
            buf.advance(words * 4);
        }

        let mut payload_len = buf.remaining();
        if padding {
            let pad = *buf.last()? as usize;
            if pad == 0 || pad > payload_len {
                return None;
            }
            payload_len -= pad;
        }

        Some(Self {
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            marker,
            payload: Bytes::copy_from_slice(&buf[..payload_len]),
        })
    }

    /// Serialize with a fixed header and no CSRCs or extensions
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u8(0x80);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7f));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Number of packets missing between two consecutive sequence numbers
///
/// Handles 16-bit wraparound. Reordered or duplicate packets count as zero.
pub fn sequence_gap(previous: u16, current: u16) -> u16 {
    let delta = current.wrapping_sub(previous);
    if delta == 0 || delta >= 0x8000 {
        0
    } else {
        delta - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_gap() {
        assert_eq!(sequence_gap(1, 2), 0);
        assert_eq!(sequence_gap(1, 5), 3);
        assert_eq!(sequence_gap(65_535, 0), 0);
        assert_eq!(sequence_gap(65_534, 1), 2);
        // reordered and duplicate
        assert_eq!(sequence_gap(10, 9), 0);
        assert_eq!(sequence_gap(10, 10), 0);
    }

    #[test]
    fn test_parse_wire_packet() {
        let packet = RtpPacket::new(96, 513, 90_000, 0xdead_beef, Bytes::from_static(b"vp8"))
            .with_marker(true);
        let wire = packet.to_bytes();
        assert_eq!(wire.len(), packet.size());
        assert_eq!(Datagram::classify(&wire), Datagram::Rtp);
        assert_eq!(RtpPacket::parse(&wire), Some(packet));
    }

    #[test]
    fn test_parse_skips_csrcs_extension_and_padding() {
        let mut wire = vec![
            0xb1, 0x6f, 0x00, 0x07, // V=2 P X CC=1, PT=111, seq 7
            0x00, 0x00, 0x00, 0x10, // timestamp
            0x00, 0x00, 0x00, 0x2a, // ssrc
            0x11, 0x11, 0x11, 0x11, // csrc
            0xbe, 0xde, 0x00, 0x01, // one-byte extension header, 1 word
            0x10, 0xff, 0x00, 0x00,
        ];
        wire.extend_from_slice(b"opus");
        wire.extend_from_slice(&[0, 0, 3]);

        let packet = RtpPacket::parse(&wire).unwrap();
        assert_eq!(packet.payload_type, 111);
        assert_eq!(packet.sequence_number, 7);
        assert_eq!(packet.ssrc, 42);
        assert!(!packet.marker);
        assert_eq!(&packet.payload[..], b"opus");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(RtpPacket::parse(&[0x80, 96, 0, 1]).is_none());
        // version 1
        assert!(RtpPacket::parse(&[0x40; 12]).is_none());
        // claims 15 CSRCs
        let mut wire = vec![0x8f, 96];
        wire.extend_from_slice(&[0; 10]);
        assert!(RtpPacket::parse(&wire).is_none());
    }

    #[test]
    fn test_classify() {
        assert_eq!(Datagram::classify(&[0x00, 0x01]), Datagram::Stun);
        assert_eq!(Datagram::classify(&[22, 0xfe]), Datagram::Dtls);
        assert_eq!(Datagram::classify(&[0x80, 200]), Datagram::Rtcp);
        assert_eq!(Datagram::classify(&[0x80, 96]), Datagram::Rtp);
        assert_eq!(Datagram::classify(&[]), Datagram::Unknown);
    }

    #[test]
    fn test_packet_size() {
        let packet = RtpPacket::new(96, 1, 0, 1, Bytes::from_static(&[0; 100])).with_marker(true);
        assert_eq!(packet.size(), 112);
        assert!(packet.marker);
    }
}
