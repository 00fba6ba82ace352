//! RTCP sender and receiver reports (RFC 3550 section 6.4)
//!
//! Only what the router needs: parsing report blocks out of compound
//! packets to derive round-trip times, and writing sender reports for the
//! streams it sends so clients have something to reference.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

const RTCP_SR: u8 = 200;
const RTCP_RR: u8 = 201;

/// Seconds between the NTP epoch (1900) and the Unix epoch
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const REPORT_BLOCK_LEN: usize = 24;

/// Reception statistics a receiver sends about one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub highest_sequence: u32,
    pub jitter: u32,
    /// Middle 32 bits of the NTP time of the last SR received
    pub last_sr: u32,
    /// Delay since that SR, in 1/65536 seconds
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    fn parse(buf: &mut &[u8]) -> Option<Self> {
        if buf.remaining() < REPORT_BLOCK_LEN {
            return None;
        }
        let ssrc = buf.get_u32();
        let lost = buf.get_u32();
        Some(Self {
            ssrc,
            fraction_lost: (lost >> 24) as u8,
            cumulative_lost: lost & 0x00ff_ffff,
            highest_sequence: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
            delay_since_last_sr: buf.get_u32(),
        })
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u32(((self.fraction_lost as u32) << 24) | (self.cumulative_lost & 0x00ff_ffff));
        buf.put_u32(self.highest_sequence);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }

    /// Round-trip time to the sender of this block
    ///
    /// `arrival` is the compact NTP time the report arrived at. Blocks that
    /// reference no SR yield `None`.
    pub fn round_trip_time(&self, arrival: u32) -> Option<Duration> {
        if self.last_sr == 0 {
            return None;
        }
        let units = arrival
            .wrapping_sub(self.last_sr)
            .wrapping_sub(self.delay_since_last_sr);
        // A negative result wraps to a huge value; treat anything over a minute as bogus
        if units > 60 << 16 {
            return None;
        }
        Some(Duration::from_nanos(units as u64 * 1_000_000_000 / 65_536))
    }
}

/// A sender report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_time: u64,
    pub rtp_time: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReportBlock>,
}

impl SenderReport {
    pub fn to_bytes(&self) -> Bytes {
        let len = 28 + self.reports.len() * REPORT_BLOCK_LEN;
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(0x80 | (self.reports.len() as u8 & 0x1f));
        buf.put_u8(RTCP_SR);
        buf.put_u16((len / 4 - 1) as u16);
        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp_time);
        buf.put_u32(self.rtp_time);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        for block in &self.reports {
            block.write(&mut buf);
        }
        buf.freeze()
    }
}

/// One packet of a compound RTCP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport { ssrc: u32, reports: Vec<ReportBlock> },
    /// Anything else (SDES, BYE, feedback), by packet type
    Other(u8),
}

impl RtcpPacket {
    /// Report blocks carried by an SR or RR
    pub fn report_blocks(&self) -> &[ReportBlock] {
        match self {
            RtcpPacket::SenderReport(sr) => &sr.reports,
            RtcpPacket::ReceiverReport { reports, .. } => reports,
            RtcpPacket::Other(_) => &[],
        }
    }
}

/// Split a compound RTCP datagram into its packets
///
/// Parsing stops at the first malformed packet; what came before is kept.
pub fn parse_compound(datagram: &[u8]) -> Vec<RtcpPacket> {
    let mut packets = Vec::new();
    let mut rest = datagram;

    while rest.len() >= 4 {
        let first = rest[0];
        if first >> 6 != 2 {
            break;
        }
        let count = (first & 0x1f) as usize;
        let packet_type = rest[1];
        let len = (u16::from_be_bytes([rest[2], rest[3]]) as usize + 1) * 4;
        if rest.len() < len {
            break;
        }

        let mut body = &rest[4..len];
        let packet = match packet_type {
            RTCP_SR => parse_sender_report(&mut body, count),
            RTCP_RR => parse_receiver_report(&mut body, count),
            other => Some(RtcpPacket::Other(other)),
        };
        match packet {
            Some(packet) => packets.push(packet),
            None => break,
        }
        rest = &rest[len..];
    }

    packets
}

fn parse_sender_report(body: &mut &[u8], count: usize) -> Option<RtcpPacket> {
    if body.remaining() < 24 {
        return None;
    }
    let ssrc = body.get_u32();
    let ntp_time = body.get_u64();
    let rtp_time = body.get_u32();
    let packet_count = body.get_u32();
    let octet_count = body.get_u32();
    let reports = parse_blocks(body, count)?;
    Some(RtcpPacket::SenderReport(SenderReport {
        ssrc,
        ntp_time,
        rtp_time,
        packet_count,
        octet_count,
        reports,
    }))
}

fn parse_receiver_report(body: &mut &[u8], count: usize) -> Option<RtcpPacket> {
    if body.remaining() < 4 {
        return None;
    }
    let ssrc = body.get_u32();
    let reports = parse_blocks(body, count)?;
    Some(RtcpPacket::ReceiverReport { ssrc, reports })
}

fn parse_blocks(body: &mut &[u8], count: usize) -> Option<Vec<ReportBlock>> {
    (0..count).map(|_| ReportBlock::parse(body)).collect()
}

/// Current wall clock as a 64-bit NTP timestamp
pub fn ntp_now() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_epoch.as_secs() + NTP_UNIX_OFFSET;
    let frac = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// Middle 32 bits of an NTP timestamp, as used in LSR fields
pub fn compact_ntp(ntp: u64) -> u32 {
    (ntp >> 16) as u32
}
