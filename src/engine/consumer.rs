//! Consumer: one outbound media track delivered to a peer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::error::{Error, Result};
use crate::media::{MediaKind, RtpPacket, RtpParameters};

use super::id::{ConsumerId, ProducerId, TransportId};
use super::producer::Producer;
use super::worker::{Resource, Worker};

/// Cumulative egress counters of a consumer
#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Packets skipped because the consumer fell behind the relay
    pub packets_dropped: u64,
}

struct ConsumerInner {
    id: ConsumerId,
    producer: Producer,
    transport_id: TransportId,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: watch::Sender<bool>,
    relay: tokio::sync::Mutex<broadcast::Receiver<RtpPacket>>,
    stats: Mutex<ConsumerStats>,
    worker: Worker,
}

/// Handle to a consumer
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.inner.id)
            .field("producer_id", &self.producer_id())
            .field("paused", &self.paused())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Consumer {
    pub(crate) async fn create(
        worker: Worker,
        transport_id: TransportId,
        producer: Producer,
        rtp_parameters: RtpParameters,
        paused: bool,
    ) -> Result<Self> {
        let relay = producer
            .subscribe()
            .ok_or(Error::ProducerNotFound(producer.id()))?;
        worker.register(Resource::Consumer).await?;

        let (closed, _) = watch::channel(false);
        let consumer = Self {
            inner: Arc::new(ConsumerInner {
                id: ConsumerId::new(),
                producer,
                transport_id,
                rtp_parameters,
                paused: AtomicBool::new(paused),
                closed,
                relay: tokio::sync::Mutex::new(relay),
                stats: Mutex::new(ConsumerStats::default()),
                worker,
            }),
        };

        tracing::debug!(
            consumer = %consumer.id(),
            producer = %consumer.producer_id(),
            transport = %transport_id,
            "Consumer created"
        );

        Ok(consumer)
    }

    pub fn id(&self) -> ConsumerId {
        self.inner.id
    }

    pub fn producer_id(&self) -> ProducerId {
        self.inner.producer.id()
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.producer.kind()
    }

    pub fn transport_id(&self) -> TransportId {
        self.inner.transport_id
    }

    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.inner.rtp_parameters
    }

    /// SSRC the client receives this track on
    pub fn ssrc(&self) -> Option<u32> {
        self.inner.rtp_parameters.encodings.first().and_then(|e| e.ssrc)
    }

    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn producer_paused(&self) -> bool {
        self.inner.producer.paused()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Returns false if it was already paused
    pub fn pause(&self) -> bool {
        !self.inner.paused.swap(true, Ordering::AcqRel)
    }

    /// Returns false if it was not paused
    pub fn resume(&self) -> bool {
        self.inner.paused.swap(false, Ordering::AcqRel)
    }

    pub fn stats(&self) -> ConsumerStats {
        self.inner.stats.lock().clone()
    }

    /// Next packet to deliver to the client
    ///
    /// Packets arriving while either side is paused are discarded. The
    /// payload type and SSRC are rewritten to the consumer's negotiated
    /// values. Returns `None` once the consumer or its producer closes.
    pub async fn recv(&self) -> Option<RtpPacket> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow_and_update() {
            return None;
        }

        let mut relay = self.inner.relay.lock().await;
        loop {
            let received = tokio::select! {
                _ = closed.changed() => return None,
                received = relay.recv() => received,
            };

            match received {
                Ok(mut packet) => {
                    if self.paused() || self.producer_paused() {
                        continue;
                    }
                    self.rewrite(&mut packet);

                    let mut stats = self.inner.stats.lock();
                    stats.packets_sent += 1;
                    stats.bytes_sent += packet.size() as u64;
                    return Some(packet);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.inner.stats.lock().packets_dropped += skipped;
                    tracing::trace!(consumer = %self.inner.id, skipped, "Consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn rewrite(&self, packet: &mut RtpPacket) {
        let params = &self.inner.rtp_parameters;
        if let Some(codec) = params.media_codec() {
            packet.payload_type = codec.payload_type;
        }
        if let Some(ssrc) = params.encodings.first().and_then(|e| e.ssrc) {
            packet.ssrc = ssrc;
        }
    }

    pub fn close(&self) {
        let was_closed = self.inner.closed.send_replace(true);
        if !was_closed {
            self.inner.worker.unregister(Resource::Consumer);
            tracing::debug!(consumer = %self.inner.id, "Consumer closed");
        }
    }
}
