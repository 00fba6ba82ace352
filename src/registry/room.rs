//! Room and peer state
//!
//! A room owns its router and flat maps of every transport, producer and
//! consumer created in it. Peers only hold id sets pointing into those maps,
//! so a lookup by id never needs to know which peer owns the object.
//! Closing anything here cascades: a transport takes its producers and
//! consumers with it, and a producer takes every consumer reading from it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::engine::{
    Consumer, ConsumerId, Producer, ProducerId, Router, TransportId, WebRtcTransport,
};
use crate::error::{Error, Result};
use crate::media::{MediaKind, RtpCapabilities};
use crate::stats::{QualityWarning, RoomStats};

pub type RoomId = String;
pub type PeerId = String;

/// Which way media flows on a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Client sends, server receives
    Producer,
    /// Server sends, client receives
    Consumer,
}

/// Server-initiated event for one peer
#[derive(Debug, Clone)]
pub enum Notification {
    NewProducer {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    TransportClosed {
        transport_id: TransportId,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    RoomClosed {
        room_id: RoomId,
    },
    /// A producer this peer consumes was paused by its owner
    ProducerPaused {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    ProducerResumed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    ChatMessage(ChatMessage),
    QualityWarning(QualityWarning),
}

/// A text message relayed to everyone in a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    /// Room the message was sent in
    pub session_id: RoomId,
    pub sender_id: PeerId,
    pub message: String,
    #[serde(rename = "type")]
    pub message_type: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(room_id: &str, sender_id: &str, message: String, message_type: String) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            message,
            message_type,
            timestamp,
        }
    }
}

/// Outbound channel of a peer's signaling connection
pub type Notifier = mpsc::UnboundedSender<Notification>;

/// A producer already present in a room, as announced to a joining peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

/// A participant of a room
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    rtp_capabilities: Option<RtpCapabilities>,
    notifier: Notifier,
    transports: HashSet<TransportId>,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

impl Peer {
    pub fn new(id: PeerId, rtp_capabilities: Option<RtpCapabilities>, notifier: Notifier) -> Self {
        Self {
            id,
            rtp_capabilities,
            notifier,
            transports: HashSet::new(),
            producers: HashSet::new(),
            consumers: HashSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Capabilities declared at join time
    pub fn rtp_capabilities(&self) -> Option<&RtpCapabilities> {
        self.rtp_capabilities.as_ref()
    }

    /// Queue a notification; a gone connection is not an error
    pub fn notify(&self, notification: Notification) -> bool {
        self.notifier.send(notification).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct TransportEntry {
    pub transport: WebRtcTransport,
    pub direction: TransportDirection,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone)]
pub struct ProducerEntry {
    pub producer: Producer,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    pub consumer: Consumer,
    pub peer_id: PeerId,
}

/// A call and everything created in it
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    router: Router,
    peers: HashMap<PeerId, Peer>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    created_at: Instant,
}

impl Room {
    pub fn new(id: RoomId, router: Router) -> Self {
        Self {
            id,
            router,
            peers: HashMap::new(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn contains_peer(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn add_peer(&mut self, peer: Peer) {
        self.peers.insert(peer.id.clone(), peer);
    }

    /// Producers of every peer other than `except`
    pub fn producer_infos(&self, except: &str) -> Vec<ProducerInfo> {
        self.producers
            .iter()
            .filter(|(_, entry)| entry.peer_id != except)
            .map(|(id, entry)| ProducerInfo {
                producer_id: *id,
                peer_id: entry.peer_id.clone(),
                kind: entry.producer.kind(),
            })
            .collect()
    }

    /// Transport owned by `peer_id` with the given direction
    pub fn transport(
        &self,
        peer_id: &str,
        transport_id: &TransportId,
        direction: Option<TransportDirection>,
    ) -> Result<&WebRtcTransport> {
        self.transports
            .get(transport_id)
            .filter(|entry| entry.peer_id == peer_id)
            .filter(|entry| direction.map_or(true, |d| d == entry.direction))
            .map(|entry| &entry.transport)
            .ok_or(Error::TransportNotFound(*transport_id))
    }

    /// Producer anywhere in the room
    pub fn producer(&self, producer_id: &ProducerId) -> Result<&Producer> {
        self.producers
            .get(producer_id)
            .map(|entry| &entry.producer)
            .ok_or(Error::ProducerNotFound(*producer_id))
    }

    /// Producer owned by `peer_id`
    pub fn own_producer(&self, peer_id: &str, producer_id: &ProducerId) -> Result<&Producer> {
        self.producers
            .get(producer_id)
            .filter(|entry| entry.peer_id == peer_id)
            .map(|entry| &entry.producer)
            .ok_or(Error::ProducerNotFound(*producer_id))
    }

    /// Consumer owned by `peer_id`
    pub fn own_consumer(&self, peer_id: &str, consumer_id: &ConsumerId) -> Result<&Consumer> {
        self.consumers
            .get(consumer_id)
            .filter(|entry| entry.peer_id == peer_id)
            .map(|entry| &entry.consumer)
            .ok_or(Error::ConsumerNotFound(*consumer_id))
    }

    pub fn insert_transport(
        &mut self,
        peer_id: &str,
        transport: WebRtcTransport,
        direction: TransportDirection,
    ) -> Result<()> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        peer.transports.insert(transport.id());
        self.transports.insert(
            transport.id(),
            TransportEntry {
                transport,
                direction,
                peer_id: peer_id.to_string(),
            },
        );
        Ok(())
    }

    /// Register a producer, then announce it to every other peer
    ///
    /// Returns how many peers were notified.
    pub fn insert_producer(&mut self, peer_id: &str, producer: Producer) -> Result<usize> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        peer.producers.insert(producer.id());

        let producer_id = producer.id();
        let kind = producer.kind();
        self.producers.insert(
            producer_id,
            ProducerEntry {
                producer,
                peer_id: peer_id.to_string(),
            },
        );

        let mut notified = 0;
        for other in self.peers.values().filter(|p| p.id != peer_id) {
            let sent = other.notify(Notification::NewProducer {
                producer_id,
                peer_id: peer_id.to_string(),
                kind,
            });
            if sent {
                notified += 1;
            }
        }
        Ok(notified)
    }

    pub fn insert_consumer(&mut self, peer_id: &str, consumer: Consumer) -> Result<()> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        peer.consumers.insert(consumer.id());
        self.consumers.insert(
            consumer.id(),
            ConsumerEntry {
                consumer,
                peer_id: peer_id.to_string(),
            },
        );
        Ok(())
    }

    /// Tell the peers consuming `producer_id` that it was paused or resumed
    ///
    /// Each peer hears once however many consumers it has; the producer's
    /// owner is not told. Returns how many peers were notified.
    pub fn notify_producer_paused(&self, producer_id: &ProducerId, paused: bool) -> usize {
        let Some(owner) = self.producers.get(producer_id).map(|e| e.peer_id.as_str()) else {
            return 0;
        };
        let audience: BTreeSet<&str> = self
            .consumers
            .values()
            .filter(|c| c.consumer.producer_id() == *producer_id && c.peer_id != owner)
            .map(|c| c.peer_id.as_str())
            .collect();

        let mut notified = 0;
        for peer in audience.into_iter().filter_map(|id| self.peers.get(id)) {
            let notification = if paused {
                Notification::ProducerPaused {
                    producer_id: *producer_id,
                    peer_id: owner.to_string(),
                }
            } else {
                Notification::ProducerResumed {
                    producer_id: *producer_id,
                    peer_id: owner.to_string(),
                }
            };
            if peer.notify(notification) {
                notified += 1;
            }
        }
        notified
    }

    /// Relay a chat message to every peer but its sender
    pub fn broadcast_chat(&self, message: &ChatMessage) -> usize {
        let mut notified = 0;
        for peer in self.peers.values().filter(|p| p.id != message.sender_id) {
            if peer.notify(Notification::ChatMessage(message.clone())) {
                notified += 1;
            }
        }
        notified
    }

    /// Close a consumer, optionally telling its owner
    pub fn close_consumer(&mut self, consumer_id: &ConsumerId, notify: bool) -> Option<Consumer> {
        let entry = self.consumers.remove(consumer_id)?;
        entry.consumer.close();

        if let Some(peer) = self.peers.get_mut(&entry.peer_id) {
            peer.consumers.remove(consumer_id);
            if notify {
                peer.notify(Notification::ConsumerClosed {
                    consumer_id: *consumer_id,
                    producer_id: entry.consumer.producer_id(),
                });
            }
        }
        Some(entry.consumer)
    }

    /// Close a producer and every consumer of it, telling their owners
    pub fn close_producer(&mut self, producer_id: &ProducerId) -> Option<Producer> {
        let entry = self.producers.remove(producer_id)?;
        self.router.close_producer(producer_id);
        entry.producer.close();

        if let Some(peer) = self.peers.get_mut(&entry.peer_id) {
            peer.producers.remove(producer_id);
        }

        let dependents: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.consumer.producer_id() == *producer_id)
            .map(|(id, _)| *id)
            .collect();
        for consumer_id in dependents {
            self.close_consumer(&consumer_id, true);
        }

        tracing::debug!(room = %self.id, producer = %producer_id, "Producer removed");
        Some(entry.producer)
    }

    /// Close a transport with its producers and consumers
    pub fn close_transport(&mut self, transport_id: &TransportId) -> Option<TransportEntry> {
        let entry = self.transports.remove(transport_id)?;

        let producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, p)| p.producer.transport_id() == *transport_id)
            .map(|(id, _)| *id)
            .collect();
        for producer_id in producers {
            self.close_producer(&producer_id);
        }

        let consumers: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.consumer.transport_id() == *transport_id)
            .map(|(id, _)| *id)
            .collect();
        for consumer_id in consumers {
            self.close_consumer(&consumer_id, false);
        }

        entry.transport.close();
        if let Some(peer) = self.peers.get_mut(&entry.peer_id) {
            peer.transports.remove(transport_id);
        }

        tracing::debug!(
            room = %self.id,
            peer = %entry.peer_id,
            transport = %transport_id,
            "Transport removed"
        );
        Some(entry)
    }

    /// Remove a peer and everything it owns, then tell the others
    pub fn remove_peer(&mut self, peer_id: &str) -> Option<Peer> {
        let transports: Vec<TransportId> = self.peers.get(peer_id)?.transports.iter().copied().collect();
        for transport_id in transports {
            self.close_transport(&transport_id);
        }

        // Anything left was not tied to one of the peer's transports
        let producers: Vec<ProducerId> = self.peers.get(peer_id)?.producers.iter().copied().collect();
        for producer_id in producers {
            self.close_producer(&producer_id);
        }
        let consumers: Vec<ConsumerId> = self.peers.get(peer_id)?.consumers.iter().copied().collect();
        for consumer_id in consumers {
            self.close_consumer(&consumer_id, false);
        }

        let peer = self.peers.remove(peer_id)?;
        for other in self.peers.values() {
            other.notify(Notification::PeerLeft {
                peer_id: peer_id.to_string(),
            });
        }
        Some(peer)
    }

    /// Tear the whole room down and tell every peer
    ///
    /// Returns the ids of the peers that were in it.
    pub fn close(&mut self) -> Vec<PeerId> {
        let transports: Vec<TransportId> = self.transports.keys().copied().collect();
        for transport_id in transports {
            self.close_transport(&transport_id);
        }
        self.router.close();

        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer in self.peers.values() {
            peer.notify(Notification::RoomClosed {
                room_id: self.id.clone(),
            });
        }
        self.peers.clear();
        self.producers.clear();
        self.consumers.clear();
        peers
    }

    /// Unconnected transports older than `timeout`, with their owners
    pub fn idle_transports(&self, timeout: Duration) -> Vec<(TransportId, PeerId)> {
        self.transports
            .iter()
            .filter(|(_, entry)| entry.transport.is_idle(timeout))
            .map(|(id, entry)| (*id, entry.peer_id.clone()))
            .collect()
    }

    /// Producers and transports of one peer, for quality sampling
    pub fn peer_media(&self, peer_id: &str) -> Option<(Vec<Producer>, Vec<WebRtcTransport>)> {
        let peer = self.peers.get(peer_id)?;
        let producers = peer
            .producers
            .iter()
            .filter_map(|id| self.producers.get(id))
            .map(|entry| entry.producer.clone())
            .collect();
        let transports = peer
            .transports
            .iter()
            .filter_map(|id| self.transports.get(id))
            .map(|entry| entry.transport.clone())
            .collect();
        Some((producers, transports))
    }

    pub fn stats(&self) -> RoomStats {
        RoomStats {
            peer_count: self.peers.len(),
            producer_count: self.producers.len(),
            consumer_count: self.consumers.len(),
            transport_count: self.transports.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::transport::tests::client_dtls;
    use crate::engine::{ProducerOptions, WebRtcTransportConfig, Worker};
    use crate::media::codec::tests::vp8_parameters;
    use crate::media::default_media_codecs;

    async fn room() -> Room {
        let (worker, _handle) = Worker::spawn(0, 42_000..=42_199);
        let router = Router::create(worker, &default_media_codecs(), WebRtcTransportConfig::default())
            .await
            .unwrap();
        Room::new("room-1".into(), router)
    }

    fn join(room: &mut Room, peer_id: &str) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        room.add_peer(Peer::new(peer_id.into(), None, tx));
        rx
    }

    async fn transport(room: &mut Room, peer_id: &str, direction: TransportDirection) -> WebRtcTransport {
        let transport = room.router().create_webrtc_transport().await.unwrap();
        transport.connect(client_dtls()).await.unwrap();
        room.insert_transport(peer_id, transport.clone(), direction).unwrap();
        transport
    }

    async fn publish(room: &mut Room, peer_id: &str) -> (WebRtcTransport, Producer) {
        let transport = transport(room, peer_id, TransportDirection::Producer).await;
        let producer = room
            .router()
            .produce(&transport, ProducerOptions::new(MediaKind::Video, vp8_parameters()))
            .await
            .unwrap();
        room.insert_producer(peer_id, producer.clone()).unwrap();
        (transport, producer)
    }

    async fn subscribe(room: &mut Room, peer_id: &str, producer: &Producer) -> Consumer {
        let transport = transport(room, peer_id, TransportDirection::Consumer).await;
        let caps = room.router().rtp_capabilities().clone();
        let consumer = room
            .router()
            .consume(&transport, &producer.id(), &caps, false)
            .await
            .unwrap();
        room.insert_consumer(peer_id, consumer.clone()).unwrap();
        consumer
    }

    #[tokio::test]
    async fn test_new_producer_reaches_only_other_peers() {
        let mut room = room().await;
        let mut rx_a = join(&mut room, "a");
        let mut rx_b = join(&mut room, "b");
        let mut rx_c = join(&mut room, "c");

        let (_, producer) = publish(&mut room, "a").await;

        for rx in [&mut rx_b, &mut rx_c] {
            match rx.try_recv().unwrap() {
                Notification::NewProducer { producer_id, peer_id, kind } => {
                    assert_eq!(producer_id, producer.id());
                    assert_eq!(peer_id, "a");
                    assert_eq!(kind, MediaKind::Video);
                }
                other => panic!("unexpected notification {:?}", other),
            }
            assert!(rx.try_recv().is_err());
        }
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transport_lookup_checks_owner_and_direction() {
        let mut room = room().await;
        let _rx_a = join(&mut room, "a");
        let _rx_b = join(&mut room, "b");

        let sending = transport(&mut room, "a", TransportDirection::Producer).await;

        assert!(room.transport("a", &sending.id(), Some(TransportDirection::Producer)).is_ok());
        assert!(room.transport("a", &sending.id(), None).is_ok());
        assert!(matches!(
            room.transport("a", &sending.id(), Some(TransportDirection::Consumer)),
            Err(Error::TransportNotFound(_))
        ));
        assert!(room.transport("b", &sending.id(), None).is_err());
    }

    #[tokio::test]
    async fn test_closing_producer_closes_consumers() {
        let mut room = room().await;
        let _rx_a = join(&mut room, "a");
        let mut rx_b = join(&mut room, "b");

        let (_, producer) = publish(&mut room, "a").await;
        let _ = rx_b.try_recv();
        let consumer = subscribe(&mut room, "b", &producer).await;

        room.close_producer(&producer.id()).unwrap();

        assert!(producer.is_closed());
        assert!(consumer.is_closed());
        assert_eq!(room.stats().consumer_count, 0);
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            Notification::ConsumerClosed { consumer_id, .. } if consumer_id == consumer.id()
        ));
    }

    #[tokio::test]
    async fn test_remove_peer_cleans_everything() {
        let mut room = room().await;
        let _rx_a = join(&mut room, "a");
        let mut rx_b = join(&mut room, "b");

        let (transport, producer) = publish(&mut room, "a").await;
        let _ = rx_b.try_recv();
        let consumer = subscribe(&mut room, "b", &producer).await;

        room.remove_peer("a").unwrap();

        assert!(transport.is_closed());
        assert!(producer.is_closed());
        assert!(consumer.is_closed());
        assert!(room.transport("a", &transport.id(), None).is_err());
        assert!(room.producer(&producer.id()).is_err());

        let stats = room.stats();
        assert_eq!(stats.peer_count, 1);
        assert_eq!(stats.producer_count, 0);
        assert_eq!(stats.consumer_count, 0);
        assert_eq!(stats.transport_count, 1);

        let mut left = false;
        while let Ok(notification) = rx_b.try_recv() {
            if let Notification::PeerLeft { peer_id } = notification {
                assert_eq!(peer_id, "a");
                left = true;
            }
        }
        assert!(left);
    }

    #[tokio::test]
    async fn test_producer_infos_exclude_requester() {
        let mut room = room().await;
        let _rx_a = join(&mut room, "a");
        let _rx_b = join(&mut room, "b");

        let (_, producer) = publish(&mut room, "a").await;

        let for_b = room.producer_infos("b");
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].producer_id, producer.id());
        assert!(room.producer_infos("a").is_empty());
    }

    #[tokio::test]
    async fn test_producer_pause_reaches_consumers_once() {
        let mut room = room().await;
        let mut rx_a = join(&mut room, "a");
        let mut rx_b = join(&mut room, "b");
        let mut rx_c = join(&mut room, "c");

        let (_, producer) = publish(&mut room, "a").await;
        let _ = rx_b.try_recv();
        let _ = rx_c.try_recv();
        subscribe(&mut room, "b", &producer).await;
        subscribe(&mut room, "b", &producer).await;

        assert_eq!(room.notify_producer_paused(&producer.id(), true), 1);
        match rx_b.try_recv().unwrap() {
            Notification::ProducerPaused { producer_id, peer_id } => {
                assert_eq!(producer_id, producer.id());
                assert_eq!(peer_id, "a");
            }
            other => panic!("unexpected notification {:?}", other),
        }
        assert!(rx_b.try_recv().is_err());
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());

        room.notify_producer_paused(&producer.id(), false);
        assert!(matches!(rx_b.try_recv().unwrap(), Notification::ProducerResumed { .. }));
    }

    #[tokio::test]
    async fn test_chat_reaches_other_peers() {
        let mut room = room().await;
        let mut rx_a = join(&mut room, "a");
        let mut rx_b = join(&mut room, "b");

        let message = ChatMessage::new("room-1", "a", "hello".into(), "text".into());
        assert_eq!(room.broadcast_chat(&message), 1);

        match rx_b.try_recv().unwrap() {
            Notification::ChatMessage(received) => assert_eq!(received, message),
            other => panic!("unexpected notification {:?}", other),
        }
        assert!(rx_a.try_recv().is_err());
        assert!(message.timestamp > 0);
    }

    #[tokio::test]
    async fn test_close_notifies_everyone() {
        let mut room = room().await;
        let mut rx_a = join(&mut room, "a");
        let (_, producer) = publish(&mut room, "a").await;

        let peers = room.close();

        assert_eq!(peers, vec!["a".to_string()]);
        assert!(producer.is_closed());
        assert!(room.router().is_closed());
        assert!(room.is_empty());
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            Notification::RoomClosed { room_id } if room_id == "room-1"
        ));
    }
}
