//! Producer: one inbound media track relayed into the router

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::media::packet::sequence_gap;
use crate::media::{MediaKind, RtpPacket, RtpParameters};

use super::id::{ProducerId, TransportId};
use super::worker::{Resource, Worker};

/// Packets buffered per producer before slow consumers start losing them
const RELAY_CAPACITY: usize = 1024;

/// Options for creating a producer
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: serde_json::Value,
    pub paused: bool,
}

impl ProducerOptions {
    pub fn new(kind: MediaKind, rtp_parameters: RtpParameters) -> Self {
        Self {
            kind,
            rtp_parameters,
            app_data: serde_json::Value::Null,
            paused: false,
        }
    }

    pub fn app_data(mut self, app_data: serde_json::Value) -> Self {
        self.app_data = app_data;
        self
    }
}

/// Video frame size as announced by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Cumulative ingress counters of a producer
#[derive(Debug, Clone, Default)]
pub struct ProducerStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Packets carrying the marker bit, i.e. completed video frames
    pub frames_received: u64,
    /// Packets missing according to sequence numbers
    pub packets_lost: u64,
    /// Time since the producer was created
    pub age: Duration,
}

impl ProducerStats {
    /// Loss percentage over the producer's lifetime
    pub fn packet_loss(&self) -> f64 {
        let expected = self.packets_received + self.packets_lost;
        if expected == 0 {
            0.0
        } else {
            self.packets_lost as f64 * 100.0 / expected as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    packets: u64,
    bytes: u64,
    frames: u64,
    lost: u64,
    last_sequence: Option<u16>,
}

struct ProducerInner {
    id: ProducerId,
    kind: MediaKind,
    transport_id: TransportId,
    rtp_parameters: RtpParameters,
    app_data: serde_json::Value,
    paused: AtomicBool,
    closed: AtomicBool,
    relay: Mutex<Option<broadcast::Sender<RtpPacket>>>,
    counters: Mutex<Counters>,
    worker: Worker,
    created_at: Instant,
}

/// Handle to a producer
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("paused", &self.paused())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Producer {
    pub(crate) async fn create(
        worker: Worker,
        transport_id: TransportId,
        options: ProducerOptions,
    ) -> Result<Self> {
        worker.register(Resource::Producer).await?;

        let (tx, _) = broadcast::channel(RELAY_CAPACITY);
        let producer = Self {
            inner: Arc::new(ProducerInner {
                id: ProducerId::new(),
                kind: options.kind,
                transport_id,
                rtp_parameters: options.rtp_parameters,
                app_data: options.app_data,
                paused: AtomicBool::new(options.paused),
                closed: AtomicBool::new(false),
                relay: Mutex::new(Some(tx)),
                counters: Mutex::new(Counters::default()),
                worker,
                created_at: Instant::now(),
            }),
        };

        tracing::debug!(
            producer = %producer.id(),
            transport = %transport_id,
            kind = %producer.kind(),
            "Producer created"
        );

        Ok(producer)
    }

    pub fn id(&self) -> ProducerId {
        self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn transport_id(&self) -> TransportId {
        self.inner.transport_id
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.inner.rtp_parameters
    }

    pub fn app_data(&self) -> &serde_json::Value {
        &self.inner.app_data
    }

    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop relaying without tearing the producer down
    ///
    /// Returns false if it was already paused.
    pub fn pause(&self) -> bool {
        let changed = !self.inner.paused.swap(true, Ordering::AcqRel);
        if changed {
            tracing::debug!(producer = %self.inner.id, "Producer paused");
        }
        changed
    }

    /// Resume relaying; a no-op on a producer that is not paused
    pub fn resume(&self) -> bool {
        let changed = self.inner.paused.swap(false, Ordering::AcqRel);
        if changed {
            tracing::debug!(producer = %self.inner.id, "Producer resumed");
        }
        changed
    }

    /// Frame size from the client's `appData.width`/`appData.height`
    pub fn resolution(&self) -> Option<Resolution> {
        let data = &self.inner.app_data;
        let width = u32::try_from(data.get("width")?.as_u64()?).ok()?;
        let height = u32::try_from(data.get("height")?.as_u64()?).ok()?;
        Some(Resolution { width, height })
    }

    /// Whether an incoming packet belongs to this track
    ///
    /// Matched by the SSRCs the client declared, or by the media payload
    /// type when it declared none. RTX packets are not accepted.
    pub fn accepts(&self, packet: &RtpPacket) -> bool {
        let params = &self.inner.rtp_parameters;
        if params.encodings.iter().any(|e| e.ssrc.is_some()) {
            return params.encodings.iter().any(|e| e.ssrc == Some(packet.ssrc));
        }
        params
            .media_codec()
            .is_some_and(|codec| codec.payload_type == packet.payload_type)
    }

    /// Feed a packet received from the client into the router
    ///
    /// Returns the number of consumers the packet was relayed to. Paused and
    /// closed producers still account for the packet but relay nothing.
    pub fn send(&self, packet: RtpPacket) -> usize {
        if self.is_closed() {
            return 0;
        }

        {
            let mut counters = self.inner.counters.lock();
            if let Some(previous) = counters.last_sequence {
                counters.lost += sequence_gap(previous, packet.sequence_number) as u64;
            }
            counters.last_sequence = Some(packet.sequence_number);
            counters.packets += 1;
            counters.bytes += packet.size() as u64;
            if packet.marker {
                counters.frames += 1;
            }
        }

        if self.paused() {
            return 0;
        }

        match self.inner.relay.lock().as_ref() {
            Some(tx) => tx.send(packet).unwrap_or(0),
            None => 0,
        }
    }

    pub(crate) fn subscribe(&self) -> Option<broadcast::Receiver<RtpPacket>> {
        self.inner.relay.lock().as_ref().map(|tx| tx.subscribe())
    }

    pub fn stats(&self) -> ProducerStats {
        let counters = self.inner.counters.lock();
        ProducerStats {
            packets_received: counters.packets,
            bytes_received: counters.bytes,
            frames_received: counters.frames,
            packets_lost: counters.lost,
            age: self.inner.created_at.elapsed(),
        }
    }

    /// Close the producer; its consumers see the end of the relay
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.relay.lock().take();
        self.inner.worker.unregister(Resource::Producer);
        tracing::debug!(producer = %self.inner.id, "Producer closed");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::media::codec::tests::vp8_parameters;

    async fn producer() -> Producer {
        let (worker, _handle) = Worker::spawn(0, 30_000..=30_010);
        let options = ProducerOptions::new(MediaKind::Video, vp8_parameters())
            .app_data(json!({"width": 1280, "height": 720}));
        Producer::create(worker, TransportId::new(), options)
            .await
            .unwrap()
    }

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket::new(96, seq, 0, 1234, Bytes::from_static(&[0; 88]))
    }

    #[tokio::test]
    async fn test_pause_resume_idempotent() {
        let producer = producer().await;

        assert!(!producer.paused());
        assert!(!producer.resume());
        assert!(producer.pause());
        assert!(!producer.pause());
        assert!(producer.paused());
        assert!(producer.resume());
        assert!(!producer.paused());
    }

    #[tokio::test]
    async fn test_ingress_accounting() {
        let producer = producer().await;

        producer.send(packet(1));
        producer.send(packet(2).with_marker(true));
        producer.send(packet(5).with_marker(true));

        let stats = producer.stats();
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.bytes_received, 300);
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.packets_lost, 2);
        assert!((stats.packet_loss() - 40.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_relay_respects_pause_and_close() {
        let producer = producer().await;
        let mut rx = producer.subscribe().unwrap();

        assert_eq!(producer.send(packet(1)), 1);
        producer.pause();
        assert_eq!(producer.send(packet(2)), 0);
        producer.resume();
        assert_eq!(producer.send(packet(3)), 1);

        assert_eq!(rx.recv().await.unwrap().sequence_number, 1);
        assert_eq!(rx.recv().await.unwrap().sequence_number, 3);

        producer.close();
        assert!(producer.is_closed());
        assert!(producer.subscribe().is_none());
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_resolution_from_app_data() {
        let producer = producer().await;
        assert_eq!(
            producer.resolution(),
            Some(Resolution {
                width: 1280,
                height: 720
            })
        );
    }

    #[tokio::test]
    async fn test_oversized_resolution_is_ignored() {
        let (worker, _handle) = Worker::spawn(0, 30_000..=30_010);
        let options = ProducerOptions::new(MediaKind::Video, vp8_parameters())
            .app_data(json!({"width": 4_294_967_296u64, "height": 720}));
        let producer = Producer::create(worker, TransportId::new(), options)
            .await
            .unwrap();

        assert_eq!(producer.resolution(), None);
    }

    #[tokio::test]
    async fn test_accepts_by_ssrc_or_payload_type() {
        let producer = producer().await;
        // vp8 parameters declare ssrc 1234
        assert!(producer.accepts(&packet(1)));
        assert!(!producer.accepts(&RtpPacket::new(96, 1, 0, 4321, Bytes::new())));

        let (worker, _handle) = Worker::spawn(0, 30_000..=30_010);
        let mut params = vp8_parameters();
        params.encodings[0].ssrc = None;
        let unannounced = Producer::create(
            worker,
            TransportId::new(),
            ProducerOptions::new(MediaKind::Video, params),
        )
        .await
        .unwrap();
        assert!(unannounced.accepts(&RtpPacket::new(96, 1, 0, 4321, Bytes::new())));
        assert!(!unannounced.accepts(&RtpPacket::new(97, 1, 0, 4321, Bytes::new())));
    }
}
