//! Room registry implementation
//!
//! The central registry that maps room ids to rooms and serializes every
//! mutation of a room behind that room's own lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::config::RegistryConfig;
use super::room::{
    ChatMessage, Notification, Notifier, Peer, PeerId, ProducerInfo, Room, RoomId,
    TransportDirection,
};
use crate::engine::{
    Consumer, ConsumerId, DtlsParameters, Producer, ProducerId, ProducerOptions, Router,
    TransportId, WebRtcTransport, WebRtcTransportConfig, WorkerPool,
};
use crate::error::{Error, Result};
use crate::media::codec::validate_rtp_capabilities;
use crate::media::{RtpCapabilities, RtpCodecCapability};
use crate::stats::{RoomStats, RoomSummary};

/// Lifecycle of a map entry
///
/// The first joiner of an unseen id inserts a `Vacant` slot and fills it
/// while holding the slot lock, so racing joiners wait and then find the
/// room open. A slot whose room was torn down is `Retired` until it leaves
/// the map; joiners that grab it retry with a fresh slot.
enum RoomSlot {
    Vacant,
    Open(Room),
    Retired,
}

/// What a peer learns when joining
#[derive(Debug, Clone)]
pub struct JoinedRoom {
    pub rtp_capabilities: RtpCapabilities,
    /// Producers other peers already have in the room
    pub producers: Vec<ProducerInfo>,
}

/// Producers and transports of one peer, sampled by the quality monitor
#[derive(Debug, Clone)]
pub struct PeerMedia {
    pub producers: Vec<Producer>,
    pub transports: Vec<WebRtcTransport>,
}

/// Central registry for all active rooms
pub struct RoomRegistry {
    /// Map of room id to room slot
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<RoomSlot>>>>,

    /// Which room each peer is in
    peers: RwLock<HashMap<PeerId, RoomId>>,

    pool: Arc<WorkerPool>,
    media_codecs: Vec<RtpCodecCapability>,
    transport_config: WebRtcTransportConfig,

    /// Configuration
    config: RegistryConfig,
}

impl RoomRegistry {
    pub fn new(
        pool: Arc<WorkerPool>,
        media_codecs: Vec<RtpCodecCapability>,
        transport_config: WebRtcTransportConfig,
        config: RegistryConfig,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            pool,
            media_codecs,
            transport_config,
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Add a peer to a room, creating the room on first join
    ///
    /// A peer already in another room leaves it first; a stale entry with the
    /// same peer id in this room is cleaned up and replaced.
    pub async fn join_room(
        &self,
        room_id: &str,
        peer_id: &str,
        rtp_capabilities: Option<RtpCapabilities>,
        notifier: Notifier,
    ) -> Result<JoinedRoom> {
        if let Some(caps) = &rtp_capabilities {
            validate_rtp_capabilities(caps)?;
        }

        if let Some(previous) = self.room_of(peer_id).await {
            if previous != room_id {
                self.remove_peer(&previous, peer_id).await;
            }
        }

        loop {
            let slot = {
                let mut rooms = self.rooms.write().await;
                Arc::clone(
                    rooms
                        .entry(room_id.to_string())
                        .or_insert_with(|| Arc::new(Mutex::new(RoomSlot::Vacant))),
                )
            };
            let mut guard = Arc::clone(&slot).lock_owned().await;

            if matches!(*guard, RoomSlot::Retired) {
                drop(guard);
                self.forget_slot(room_id, &slot).await;
                continue;
            }

            if matches!(*guard, RoomSlot::Vacant) {
                match self.create_router().await {
                    Ok(router) => {
                        tracing::info!(
                            room = %room_id,
                            router = %router.id(),
                            worker = router.worker_id(),
                            "Room created"
                        );
                        *guard = RoomSlot::Open(Room::new(room_id.to_string(), router));
                    }
                    Err(e) => {
                        *guard = RoomSlot::Retired;
                        drop(guard);
                        self.forget_slot(room_id, &slot).await;
                        return Err(e);
                    }
                }
            }

            let RoomSlot::Open(room) = &mut *guard else {
                continue;
            };

            if room.remove_peer(peer_id).is_some() {
                tracing::warn!(room = %room_id, peer = %peer_id, "Replaced stale peer entry");
            }
            room.add_peer(Peer::new(peer_id.to_string(), rtp_capabilities, notifier));

            let joined = JoinedRoom {
                rtp_capabilities: room.router().rtp_capabilities().clone(),
                producers: room.producer_infos(peer_id),
            };

            tracing::info!(
                room = %room_id,
                peer = %peer_id,
                peers = room.peer_count(),
                existing_producers = joined.producers.len(),
                "Peer joined"
            );

            self.peers
                .write()
                .await
                .insert(peer_id.to_string(), room_id.to_string());

            return Ok(joined);
        }
    }

    /// Remove a peer and everything it owns
    ///
    /// The room is closed and dropped once its last peer is gone. Returns
    /// false if the peer was not in the room.
    pub async fn remove_peer(&self, room_id: &str, peer_id: &str) -> bool {
        let Some(slot) = self.slot(room_id).await else {
            return false;
        };
        let mut guard = Arc::clone(&slot).lock_owned().await;
        let RoomSlot::Open(room) = &mut *guard else {
            return false;
        };

        let removed = room.remove_peer(peer_id).is_some();
        if removed {
            tracing::info!(
                room = %room_id,
                peer = %peer_id,
                peers = room.peer_count(),
                "Peer left"
            );

            let mut peers = self.peers.write().await;
            if peers.get(peer_id).map(String::as_str) == Some(room_id) {
                peers.remove(peer_id);
            }
        }

        if room.is_empty() {
            room.close();
            *guard = RoomSlot::Retired;
            drop(guard);
            self.forget_slot(room_id, &slot).await;
            tracing::info!(room = %room_id, "Room closed (empty)");
        }

        removed
    }

    /// Create a send or receive transport for a peer
    pub async fn create_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        direction: TransportDirection,
    ) -> Result<WebRtcTransport> {
        let mut guard = self.lock_room(room_id).await?;
        let room = open_room(&mut guard, room_id)?;

        if !room.contains_peer(peer_id) {
            return Err(Error::PeerNotFound(peer_id.to_string()));
        }

        let transport = room.router().create_webrtc_transport().await?;
        room.insert_transport(peer_id, transport.clone(), direction)?;

        tracing::info!(
            room = %room_id,
            peer = %peer_id,
            transport = %transport.id(),
            direction = ?direction,
            "Transport created"
        );

        Ok(transport)
    }

    /// Complete a transport's DTLS setup
    pub async fn connect_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &TransportId,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let mut guard = self.lock_room(room_id).await?;
        let room = open_room(&mut guard, room_id)?;

        let transport = room.transport(peer_id, transport_id, Some(direction))?;
        transport.connect(dtls_parameters).await?;

        tracing::info!(
            room = %room_id,
            peer = %peer_id,
            transport = %transport_id,
            "Transport connected"
        );
        Ok(())
    }

    /// Create a producer and announce it to the rest of the room
    ///
    /// The announcement goes out only after the producer is registered, so
    /// any peer reacting to it can consume immediately.
    pub async fn produce(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &TransportId,
        options: ProducerOptions,
    ) -> Result<Producer> {
        let mut guard = self.lock_room(room_id).await?;
        let room = open_room(&mut guard, room_id)?;

        let transport = room
            .transport(peer_id, transport_id, Some(TransportDirection::Producer))?
            .clone();
        let producer = room.router().produce(&transport, options).await?;
        let notified = room.insert_producer(peer_id, producer.clone())?;

        tracing::info!(
            room = %room_id,
            peer = %peer_id,
            producer = %producer.id(),
            kind = %producer.kind(),
            notified,
            "Producer created"
        );

        Ok(producer)
    }

    /// Create a consumer of `producer_id` for a peer
    ///
    /// Without explicit capabilities the ones given at join are used.
    /// Refused without side effects if the capabilities cannot decode the
    /// producer's codec.
    pub async fn consume(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: Option<&RtpCapabilities>,
    ) -> Result<Consumer> {
        let mut guard = self.lock_room(room_id).await?;
        let room = open_room(&mut guard, room_id)?;

        let transport = room
            .transport(peer_id, transport_id, Some(TransportDirection::Consumer))?
            .clone();
        room.producer(producer_id)?;

        let rtp_capabilities = match rtp_capabilities {
            Some(caps) => caps.clone(),
            None => room
                .peer(peer_id)
                .and_then(|peer| peer.rtp_capabilities())
                .cloned()
                .ok_or_else(|| Error::InvalidRtpParameters("no rtp capabilities".into()))?,
        };
        let rtp_capabilities = &rtp_capabilities;
        validate_rtp_capabilities(rtp_capabilities)?;

        if !room.router().can_consume(producer_id, rtp_capabilities) {
            tracing::debug!(
                room = %room_id,
                peer = %peer_id,
                producer = %producer_id,
                "Consume refused, incompatible capabilities"
            );
            return Err(Error::IncompatibleCapabilities(*producer_id));
        }

        let consumer = room
            .router()
            .consume(&transport, producer_id, rtp_capabilities, false)
            .await?;
        room.insert_consumer(peer_id, consumer.clone())?;

        tracing::info!(
            room = %room_id,
            peer = %peer_id,
            consumer = %consumer.id(),
            producer = %producer_id,
            "Consumer created"
        );

        Ok(consumer)
    }

    /// Pause or resume one of the peer's producers
    ///
    /// Returns whether the state changed; repeating a call is not an error.
    pub async fn set_producer_paused(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: &ProducerId,
        paused: bool,
    ) -> Result<bool> {
        let mut guard = self.lock_room(room_id).await?;
        let room = open_room(&mut guard, room_id)?;

        let producer = room.own_producer(peer_id, producer_id)?;
        let changed = if paused {
            producer.pause()
        } else {
            producer.resume()
        };
        let notified = if changed {
            room.notify_producer_paused(producer_id, paused)
        } else {
            0
        };

        tracing::debug!(
            room = %room_id,
            producer = %producer_id,
            paused,
            changed,
            notified,
            "Producer pause state set"
        );
        Ok(changed)
    }

    /// Pause or resume one of the peer's consumers
    pub async fn set_consumer_paused(
        &self,
        room_id: &str,
        peer_id: &str,
        consumer_id: &ConsumerId,
        paused: bool,
    ) -> Result<bool> {
        let mut guard = self.lock_room(room_id).await?;
        let room = open_room(&mut guard, room_id)?;

        let consumer = room.own_consumer(peer_id, consumer_id)?;
        Ok(if paused {
            consumer.pause()
        } else {
            consumer.resume()
        })
    }

    /// Relay a chat message from a peer to the rest of its room
    pub async fn send_chat(
        &self,
        room_id: &str,
        peer_id: &str,
        message: String,
        message_type: String,
    ) -> Result<ChatMessage> {
        let mut guard = self.lock_room(room_id).await?;
        let room = open_room(&mut guard, room_id)?;
        if !room.contains_peer(peer_id) {
            return Err(Error::PeerNotFound(peer_id.to_string()));
        }

        let chat = ChatMessage::new(room_id, peer_id, message, message_type);
        let notified = room.broadcast_chat(&chat);
        tracing::debug!(
            room = %room_id,
            peer = %peer_id,
            length = chat.message.len(),
            notified,
            "Chat message relayed"
        );
        Ok(chat)
    }

    /// Close one of the peer's producers and every consumer of it
    pub async fn close_producer(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: &ProducerId,
    ) -> Result<()> {
        let mut guard = self.lock_room(room_id).await?;
        let room = open_room(&mut guard, room_id)?;

        room.own_producer(peer_id, producer_id)?;
        room.close_producer(producer_id);

        tracing::info!(room = %room_id, peer = %peer_id, producer = %producer_id, "Producer closed");
        Ok(())
    }

    /// Close one of the peer's transports with everything on it
    pub async fn close_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &TransportId,
    ) -> Result<()> {
        let mut guard = self.lock_room(room_id).await?;
        let room = open_room(&mut guard, room_id)?;

        room.transport(peer_id, transport_id, None)?;
        room.close_transport(transport_id);

        tracing::info!(room = %room_id, peer = %peer_id, transport = %transport_id, "Transport closed");
        Ok(())
    }

    /// Get room statistics, `None` if the room does not exist
    pub async fn room_stats(&self, room_id: &str) -> Option<RoomStats> {
        let slot = self.slot(room_id).await?;
        let guard = slot.lock().await;
        match &*guard {
            RoomSlot::Open(room) => Some(room.stats()),
            _ => None,
        }
    }

    /// Summaries of every open room
    pub async fn all_rooms(&self) -> Vec<RoomSummary> {
        let mut summaries = Vec::new();
        for slot in self.slots().await {
            let guard = slot.lock().await;
            if let RoomSlot::Open(room) = &*guard {
                summaries.push(RoomSummary {
                    room_id: room.id().to_string(),
                    router_id: room.router().id().to_string(),
                    worker_id: room.router().worker_id(),
                    stats: room.stats(),
                    age_secs: room.age().as_secs(),
                });
            }
        }
        summaries.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        summaries
    }

    /// Whether a room with at least one peer exists
    pub async fn room_exists(&self, room_id: &str) -> bool {
        self.room_stats(room_id).await.is_some()
    }

    /// Number of open rooms
    pub async fn room_count(&self) -> usize {
        let mut count = 0;
        for slot in self.slots().await {
            if matches!(*slot.lock().await, RoomSlot::Open(_)) {
                count += 1;
            }
        }
        count
    }

    /// Administrative close; every peer in the room gets `RoomClosed`
    pub async fn close_room(&self, room_id: &str) -> bool {
        let Some(slot) = self.slot(room_id).await else {
            return false;
        };
        let mut guard = Arc::clone(&slot).lock_owned().await;
        let RoomSlot::Open(room) = &mut *guard else {
            return false;
        };

        let peers = room.close();
        *guard = RoomSlot::Retired;
        drop(guard);

        {
            let mut index = self.peers.write().await;
            for peer_id in &peers {
                if index.get(peer_id).map(String::as_str) == Some(room_id) {
                    index.remove(peer_id);
                }
            }
        }
        self.forget_slot(room_id, &slot).await;

        tracing::info!(room = %room_id, peers = peers.len(), "Room closed by administrator");
        true
    }

    /// Room the peer is currently in
    pub async fn room_of(&self, peer_id: &str) -> Option<RoomId> {
        self.peers.read().await.get(peer_id).cloned()
    }

    /// Ids of every joined peer
    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().cloned().collect()
    }

    /// Producers and transports of a peer
    pub async fn peer_media(&self, peer_id: &str) -> Option<PeerMedia> {
        let room_id = self.room_of(peer_id).await?;
        let slot = self.slot(&room_id).await?;
        let guard = slot.lock().await;
        match &*guard {
            RoomSlot::Open(room) => {
                let (producers, transports) = room.peer_media(peer_id)?;
                Some(PeerMedia {
                    producers,
                    transports,
                })
            }
            _ => None,
        }
    }

    /// Push a notification to a peer wherever it is
    pub async fn notify_peer(&self, peer_id: &str, notification: Notification) -> bool {
        let Some(room_id) = self.room_of(peer_id).await else {
            return false;
        };
        let Some(slot) = self.slot(&room_id).await else {
            return false;
        };
        let guard = slot.lock().await;
        match &*guard {
            RoomSlot::Open(room) => room
                .peer(peer_id)
                .map(|peer| peer.notify(notification))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Close transports that never completed their DTLS connect in time
    ///
    /// Owners are told with `TransportClosed`. Returns how many were closed.
    pub async fn reap_idle_transports(&self) -> usize {
        let timeout = self.config.transport_idle_timeout;
        let mut reaped = 0;

        for slot in self.slots().await {
            let mut guard = slot.lock().await;
            let RoomSlot::Open(room) = &mut *guard else {
                continue;
            };

            for (transport_id, peer_id) in room.idle_transports(timeout) {
                room.close_transport(&transport_id);
                if let Some(peer) = room.peer(&peer_id) {
                    peer.notify(Notification::TransportClosed { transport_id });
                }
                reaped += 1;

                tracing::info!(
                    room = %room.id(),
                    peer = %peer_id,
                    transport = %transport_id,
                    "Idle transport reclaimed"
                );
            }
        }

        reaped
    }

    /// Spawn background cleanup task
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.reap_idle_transports().await;
            }
        })
    }

    async fn create_router(&self) -> Result<Router> {
        let worker = self.pool.acquire_worker()?;
        Router::create(worker, &self.media_codecs, self.transport_config.clone()).await
    }

    async fn slot(&self, room_id: &str) -> Option<Arc<Mutex<RoomSlot>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn slots(&self) -> Vec<Arc<Mutex<RoomSlot>>> {
        self.rooms.read().await.values().cloned().collect()
    }

    async fn lock_room(&self, room_id: &str) -> Result<OwnedMutexGuard<RoomSlot>> {
        let slot = self
            .slot(room_id)
            .await
            .ok_or_else(|| Error::RoomNotFound(room_id.to_string()))?;
        Ok(slot.lock_owned().await)
    }

    /// Drop a map entry if it still points at `slot`
    async fn forget_slot(&self, room_id: &str, slot: &Arc<Mutex<RoomSlot>>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            rooms.remove(room_id);
        }
    }
}

fn open_room<'a>(slot: &'a mut RoomSlot, room_id: &str) -> Result<&'a mut Room> {
    match slot {
        RoomSlot::Open(room) => Ok(room),
        _ => Err(Error::RoomNotFound(room_id.to_string())),
    }
}
