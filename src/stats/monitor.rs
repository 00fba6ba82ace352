//! Connection quality monitor
//!
//! Polls every joined peer on a fixed interval, derives bitrate, frame rate
//! and packet loss from the deltas of its producers' ingress counters and
//! raises a warning when video bitrate drops under a floor or audio loss
//! climbs over a ceiling. The monitor only observes; it never changes
//! routing state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::metrics::{kbps, loss_percent, rate, ConnectionStats, LinkStats};
use crate::config::duration_ms;
use crate::engine::{ProducerId, ProducerStats};
use crate::media::MediaKind;
use crate::registry::{Notification, PeerId, PeerMedia, RoomRegistry};

/// Warnings buffered for slow event subscribers
const EVENT_CAPACITY: usize = 256;

/// Monitor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Whether the server runs the monitor at all
    pub enabled: bool,

    /// Poll interval
    #[serde(with = "duration_ms")]
    pub interval: Duration,

    /// Video bitrate below this (kbps) raises a warning
    pub video_bitrate_floor: f64,

    /// Audio packet loss above this (percent) raises a warning
    pub audio_loss_ceiling: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            video_bitrate_floor: 250.0,
            audio_loss_ceiling: 3.0,
        }
    }
}

impl MonitorConfig {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn video_bitrate_floor(mut self, kbps: f64) -> Self {
        self.video_bitrate_floor = kbps;
        self
    }

    pub fn audio_loss_ceiling(mut self, percent: f64) -> Self {
        self.audio_loss_ceiling = percent;
        self
    }
}

/// What went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityIssue {
    LowVideoBitrate,
    HighAudioPacketLoss,
}

/// A quality threshold crossed by one peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityWarning {
    pub peer_id: PeerId,
    pub issue: QualityIssue,
    pub value: f64,
    pub threshold: f64,
}

/// Counters seen at the previous poll
struct Sample {
    at: Instant,
    producers: HashMap<ProducerId, ProducerStats>,
}

pub struct QualityMonitor {
    registry: Arc<RoomRegistry>,
    config: MonitorConfig,
    samples: Mutex<HashMap<PeerId, Sample>>,
    events: broadcast::Sender<QualityWarning>,
}

impl QualityMonitor {
    pub fn new(registry: Arc<RoomRegistry>, config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            config,
            samples: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Receive every warning the monitor raises
    pub fn subscribe(&self) -> broadcast::Receiver<QualityWarning> {
        self.events.subscribe()
    }

    /// Current quality of one peer, `None` if it is not joined
    ///
    /// Rates cover the time since the last poll, or the producer's lifetime
    /// before the first one.
    pub async fn get_connection_stats(&self, peer_id: &str) -> Option<ConnectionStats> {
        let media = self.registry.peer_media(peer_id).await?;
        let samples = self.samples.lock();
        Some(measure(&media, samples.get(peer_id)))
    }

    /// Sample every peer once and raise warnings
    pub async fn poll_once(&self) -> Vec<QualityWarning> {
        let peer_ids = self.registry.peer_ids().await;
        let mut warnings = Vec::new();
        let mut seen = Vec::with_capacity(peer_ids.len());

        for peer_id in peer_ids {
            let Some(media) = self.registry.peer_media(&peer_id).await else {
                continue;
            };

            let stats = {
                let mut samples = self.samples.lock();
                let stats = measure(&media, samples.get(&peer_id));
                samples.insert(
                    peer_id.clone(),
                    Sample {
                        at: Instant::now(),
                        producers: media
                            .producers
                            .iter()
                            .map(|p| (p.id(), p.stats()))
                            .collect(),
                    },
                );
                stats
            };

            tracing::trace!(
                peer = %peer_id,
                video_kbps = stats.video.bitrate,
                audio_loss = stats.audio.packet_loss,
                "Quality sampled"
            );

            warnings.extend(self.evaluate(&peer_id, &media, &stats));
            seen.push(peer_id);
        }

        self.samples.lock().retain(|peer_id, _| seen.contains(peer_id));

        for warning in &warnings {
            tracing::warn!(
                peer = %warning.peer_id,
                issue = ?warning.issue,
                value = warning.value,
                threshold = warning.threshold,
                "Quality warning"
            );
            let _ = self.events.send(warning.clone());
            self.registry
                .notify_peer(&warning.peer_id, Notification::QualityWarning(warning.clone()))
                .await;
        }

        warnings
    }

    /// Spawn the polling loop
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = monitor.config.interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                monitor.poll_once().await;
            }
        })
    }

    fn evaluate(&self, peer_id: &str, media: &PeerMedia, stats: &ConnectionStats) -> Vec<QualityWarning> {
        // Producers younger than one interval, or that never carried media,
        // have nothing to judge yet
        let settled = |kind: MediaKind| {
            media.producers.iter().any(|p| {
                let stats = p.stats();
                p.kind() == kind
                    && !p.paused()
                    && stats.packets_received > 0
                    && stats.age >= self.config.interval
            })
        };

        let mut warnings = Vec::new();

        if settled(MediaKind::Video) && stats.video.bitrate < self.config.video_bitrate_floor {
            warnings.push(QualityWarning {
                peer_id: peer_id.to_string(),
                issue: QualityIssue::LowVideoBitrate,
                value: stats.video.bitrate,
                threshold: self.config.video_bitrate_floor,
            });
        }

        if settled(MediaKind::Audio) && stats.audio.packet_loss > self.config.audio_loss_ceiling {
            warnings.push(QualityWarning {
                peer_id: peer_id.to_string(),
                issue: QualityIssue::HighAudioPacketLoss,
                value: stats.audio.packet_loss,
                threshold: self.config.audio_loss_ceiling,
            });
        }

        warnings
    }
}

fn measure(media: &PeerMedia, previous: Option<&Sample>) -> ConnectionStats {
    let mut stats = ConnectionStats::default();
    let (mut audio_received, mut audio_lost) = (0, 0);

    for producer in &media.producers {
        let current = producer.stats();
        let before = previous.and_then(|s| s.producers.get(&producer.id()).map(|b| (s.at, b)));

        let (bytes, frames, received, lost, elapsed) = match before {
            Some((at, before)) => (
                current.bytes_received.saturating_sub(before.bytes_received),
                current.frames_received.saturating_sub(before.frames_received),
                current.packets_received.saturating_sub(before.packets_received),
                current.packets_lost.saturating_sub(before.packets_lost),
                at.elapsed(),
            ),
            None => (
                current.bytes_received,
                current.frames_received,
                current.packets_received,
                current.packets_lost,
                current.age,
            ),
        };

        match producer.kind() {
            MediaKind::Video => {
                stats.video.bitrate += kbps(bytes, elapsed);
                stats.video.fps = stats.video.fps.max(rate(frames, elapsed));
                if stats.video.resolution.is_none() {
                    stats.video.resolution = producer.resolution();
                }
            }
            MediaKind::Audio => {
                stats.audio.bitrate += kbps(bytes, elapsed);
                audio_received += received;
                audio_lost += lost;
            }
        }
    }

    stats.audio.packet_loss = loss_percent(audio_received, audio_lost);
    stats.connection = LinkStats {
        rtt: media
            .transports
            .iter()
            .filter_map(|t| t.rtt())
            .max()
            .map(|rtt| rtt.as_secs_f64() * 1000.0),
    };

    stats
}
