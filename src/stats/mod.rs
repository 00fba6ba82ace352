//! Statistics and quality monitoring

pub mod metrics;
pub mod monitor;

pub use metrics::{
    AudioStats, ConnectionStats, LinkStats, RoomStats, RoomSummary, ServerStats, VideoStats,
};
pub use monitor::{MonitorConfig, QualityIssue, QualityMonitor, QualityWarning};
