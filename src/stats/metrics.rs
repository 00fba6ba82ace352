//! Statistics snapshots for rooms, peers and the server

use std::time::Duration;

use serde::Serialize;

use crate::engine::Resolution;

/// Counts of what a room currently holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub peer_count: usize,
    pub producer_count: usize,
    pub consumer_count: usize,
    pub transport_count: usize,
}

/// One entry of the administrative room listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub router_id: String,
    pub worker_id: usize,
    #[serde(flatten)]
    pub stats: RoomStats,
    /// Seconds since the room was created
    pub age_secs: u64,
}

/// Outgoing video quality of a peer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VideoStats {
    /// kbps
    pub bitrate: f64,
    pub fps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

/// Outgoing audio quality of a peer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStats {
    /// kbps
    pub bitrate: f64,
    /// Percentage of packets lost
    pub packet_loss: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkStats {
    /// Round-trip time in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt: Option<f64>,
}

/// Per-peer connection quality
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub video: VideoStats,
    pub audio: AudioStats,
    pub connection: LinkStats,
}

/// Server-wide statistics
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    /// Total connections ever
    pub total_connections: u64,
    /// Current active connections
    pub active_connections: u64,
    /// Rooms with at least one peer
    pub active_rooms: u64,
    /// Uptime
    #[serde(serialize_with = "crate::config::duration_ms::serialize")]
    pub uptime: Duration,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Kilobits per second for `bytes` transferred over `elapsed`
pub fn kbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 * 8.0 / 1000.0 / secs
    } else {
        0.0
    }
}

/// Events per second
pub fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

/// Loss percentage given packets received and packets missing
pub fn loss_percent(received: u64, lost: u64) -> f64 {
    let expected = received + lost;
    if expected == 0 {
        0.0
    } else {
        lost as f64 * 100.0 / expected as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kbps() {
        // 125,000 bytes in one second is 1,000 kbps
        assert_eq!(kbps(125_000, Duration::from_secs(1)), 1000.0);
        assert_eq!(kbps(125_000, Duration::from_secs(5)), 200.0);
        assert_eq!(kbps(125_000, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_rate() {
        assert_eq!(rate(150, Duration::from_secs(5)), 30.0);
        assert_eq!(rate(150, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_loss_percent() {
        assert_eq!(loss_percent(0, 0), 0.0);
        assert_eq!(loss_percent(97, 3), 3.0);
        assert_eq!(loss_percent(0, 10), 100.0);
    }

    #[test]
    fn test_connection_stats_shape() {
        let stats = ConnectionStats {
            video: VideoStats {
                bitrate: 800.0,
                fps: 30.0,
                resolution: Some(Resolution {
                    width: 640,
                    height: 480,
                }),
            },
            audio: AudioStats {
                bitrate: 32.0,
                packet_loss: 1.5,
            },
            connection: LinkStats { rtt: Some(42.0) },
        };

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["video"]["resolution"]["width"], 640);
        assert_eq!(json["audio"]["packetLoss"], 1.5);
        assert_eq!(json["connection"]["rtt"], 42.0);
    }

    #[test]
    fn test_room_summary_flattens_stats() {
        let summary = RoomSummary {
            room_id: "room-1".into(),
            router_id: "r".into(),
            worker_id: 0,
            stats: RoomStats {
                peer_count: 2,
                ..Default::default()
            },
            age_secs: 3,
        };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["roomId"], "room-1");
        assert_eq!(json["peerCount"], 2);
    }

    #[test]
    fn test_server_stats_new() {
        let stats = ServerStats::new();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
    }
}
