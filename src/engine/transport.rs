//! WebRTC transport
//!
//! One ICE-lite / DTLS endpoint per direction per peer. The transport hands
//! the client everything it needs to reach the server (ICE credentials,
//! candidates, DTLS fingerprint) and becomes usable for media once the
//! client's DTLS parameters arrive through `connect`.
//!
//! With UDP enabled the transport's port is bound on every listen address.
//! After `connect`, RTP arriving there is routed to the matching producer,
//! RTCP receiver reports update the round-trip time, and each consumer's
//! packets are sent back to the address the client sends from.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::media::codec::{consumer_parameters, validate_producer_parameters, ConsumerIdentity};
use crate::media::rtcp::{compact_ntp, ntp_now, parse_compound, SenderReport};
use crate::media::{Datagram, RtpCapabilities, RtpPacket};

use super::config::WebRtcTransportConfig;
use super::consumer::Consumer;
use super::id::{random_u32, RouterId, TransportId};
use super::producer::{Producer, ProducerOptions};
use super::socket::MediaSocket;
use super::worker::Worker;

/// Hash functions accepted for DTLS fingerprints
const FINGERPRINT_ALGORITHMS: &[&str] = &["sha-1", "sha-224", "sha-256", "sha-384", "sha-512"];

/// SCTP port used for data channels
const SCTP_PORT: u16 = 5000;

/// Largest datagram read from a media socket
const MAX_DATAGRAM: usize = 2048;

/// How often a consumer that is sending emits an RTCP sender report
const SENDER_REPORT_INTERVAL: Duration = Duration::from_secs(1);

const UDP_PRIORITY: u32 = 1_076_302_079;
const TCP_PRIORITY: u32 = 1_076_276_479;

/// ICE credentials of the server side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

/// Transport protocol of an ICE candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

/// A host candidate the client can send to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

/// DTLS role of one side of the handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

impl DtlsParameters {
    /// Reject parameters a DTLS handshake could never complete with
    pub fn validate(&self) -> Result<()> {
        if self.fingerprints.is_empty() {
            return Err(Error::InvalidDtlsParameters("no fingerprints".into()));
        }

        for fingerprint in &self.fingerprints {
            let algorithm = fingerprint.algorithm.to_ascii_lowercase();
            if !FINGERPRINT_ALGORITHMS.contains(&algorithm.as_str()) {
                return Err(Error::InvalidDtlsParameters(format!(
                    "unsupported fingerprint algorithm {}",
                    fingerprint.algorithm
                )));
            }

            let well_formed = !fingerprint.value.is_empty()
                && fingerprint
                    .value
                    .split(':')
                    .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));
            if !well_formed {
                return Err(Error::InvalidDtlsParameters(format!(
                    "malformed {} fingerprint",
                    fingerprint.algorithm
                )));
            }
        }

        Ok(())
    }
}

/// Data channel transport parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SctpParameters {
    pub port: u16,
    #[serde(rename = "OS")]
    pub os: u16,
    #[serde(rename = "MIS")]
    pub mis: u16,
    pub max_message_size: u32,
}

/// DTLS handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connected,
    Closed,
}

struct TransportState {
    dtls_state: DtlsState,
    remote_dtls: Option<DtlsParameters>,
    rtt: Option<Duration>,
}

/// Consumers wait here until the client's address is known
#[derive(Default)]
struct Egress {
    started: bool,
    pending: Vec<Consumer>,
}

struct TransportInner {
    id: TransportId,
    router_id: RouterId,
    worker: Worker,
    port: u16,
    socket: Mutex<Option<Arc<MediaSocket>>>,
    producers: Mutex<Vec<Producer>>,
    egress: Mutex<Egress>,
    tasks: Mutex<Vec<AbortHandle>>,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    sctp_parameters: Option<SctpParameters>,
    max_incoming_bitrate: u32,
    state: Mutex<TransportState>,
    next_mid: AtomicU32,
    closed: AtomicBool,
    created_at: Instant,
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Handle to a WebRTC transport
#[derive(Clone)]
pub struct WebRtcTransport {
    inner: Arc<TransportInner>,
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("id", &self.inner.id)
            .field("port", &self.inner.port)
            .field("dtls_state", &self.dtls_state())
            .finish()
    }
}

impl WebRtcTransport {
    pub(crate) async fn create(
        worker: Worker,
        router_id: RouterId,
        config: &WebRtcTransportConfig,
    ) -> Result<Self> {
        let (port, socket) = open_port(&worker, config).await?;

        let mut ice_candidates = Vec::new();
        for listen_ip in &config.listen_ips {
            let ip = listen_ip.candidate_address();
            if config.enable_udp {
                ice_candidates.push(IceCandidate {
                    foundation: "udpcandidate".into(),
                    priority: UDP_PRIORITY,
                    ip: ip.clone(),
                    protocol: Protocol::Udp,
                    port,
                    candidate_type: "host".into(),
                    tcp_type: None,
                });
            }
            if config.enable_tcp {
                ice_candidates.push(IceCandidate {
                    foundation: "tcpcandidate".into(),
                    priority: TCP_PRIORITY,
                    ip,
                    protocol: Protocol::Tcp,
                    port,
                    candidate_type: "host".into(),
                    tcp_type: Some("passive".into()),
                });
            }
        }
        if !config.prefer_udp {
            ice_candidates.reverse();
        }

        let sctp_parameters = config.enable_sctp.then(|| SctpParameters {
            port: SCTP_PORT,
            os: 1024,
            mis: 1024,
            max_message_size: config.max_sctp_message_size,
        });

        let transport = Self {
            inner: Arc::new(TransportInner {
                id: TransportId::new(),
                router_id,
                worker,
                port,
                socket: Mutex::new(socket.map(Arc::new)),
                producers: Mutex::new(Vec::new()),
                egress: Mutex::new(Egress::default()),
                tasks: Mutex::new(Vec::new()),
                ice_parameters: IceParameters {
                    username_fragment: random_token(16),
                    password: random_token(32),
                    ice_lite: true,
                },
                ice_candidates,
                dtls_parameters: DtlsParameters {
                    role: DtlsRole::Auto,
                    fingerprints: vec![DtlsFingerprint {
                        algorithm: "sha-256".into(),
                        value: random_fingerprint(),
                    }],
                },
                sctp_parameters,
                max_incoming_bitrate: config.max_incoming_bitrate,
                state: Mutex::new(TransportState {
                    dtls_state: DtlsState::New,
                    remote_dtls: None,
                    rtt: None,
                }),
                next_mid: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                created_at: Instant::now(),
            }),
        };

        tracing::debug!(
            transport = %transport.id(),
            router = %router_id,
            port,
            "Transport created"
        );

        transport.spawn_receivers();
        Ok(transport)
    }

    pub fn id(&self) -> TransportId {
        self.inner.id
    }

    pub fn router_id(&self) -> RouterId {
        self.inner.router_id
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Address the client sends media from, once learned
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|socket| socket.remote())
    }

    pub fn ice_parameters(&self) -> &IceParameters {
        &self.inner.ice_parameters
    }

    pub fn ice_candidates(&self) -> &[IceCandidate] {
        &self.inner.ice_candidates
    }

    pub fn dtls_parameters(&self) -> &DtlsParameters {
        &self.inner.dtls_parameters
    }

    pub fn sctp_parameters(&self) -> Option<&SctpParameters> {
        self.inner.sctp_parameters.as_ref()
    }

    pub fn max_incoming_bitrate(&self) -> u32 {
        self.inner.max_incoming_bitrate
    }

    pub fn dtls_state(&self) -> DtlsState {
        self.inner.state.lock().dtls_state
    }

    pub fn is_connected(&self) -> bool {
        self.dtls_state() == DtlsState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        self.inner.created_at.elapsed()
    }

    /// Never connected and older than `timeout`
    pub fn is_idle(&self, timeout: Duration) -> bool {
        !self.is_closed() && !self.is_connected() && self.age() >= timeout
    }

    /// Complete the DTLS setup with the client's parameters
    ///
    /// Repeating the call with identical parameters succeeds without effect.
    pub async fn connect(&self, remote: DtlsParameters) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportNotFound(self.inner.id));
        }
        if !self.inner.worker.is_alive() {
            return Err(Error::WorkerFatal(self.inner.worker.id()));
        }
        remote.validate()?;

        let mut state = self.inner.state.lock();
        match &state.remote_dtls {
            Some(existing) if *existing == remote => return Ok(()),
            Some(_) => return Err(Error::TransportAlreadyConnected(self.inner.id)),
            None => {}
        }

        state.remote_dtls = Some(remote);
        state.dtls_state = DtlsState::Connected;
        drop(state);

        tracing::debug!(transport = %self.inner.id, "Transport connected");
        Ok(())
    }

    /// Start receiving a track from the client
    pub async fn produce(
        &self,
        options: ProducerOptions,
        router_caps: &RtpCapabilities,
    ) -> Result<Producer> {
        if self.is_closed() {
            return Err(Error::TransportNotFound(self.inner.id));
        }
        if !self.is_connected() {
            return Err(Error::TransportNotConnected(self.inner.id));
        }
        validate_producer_parameters(options.kind, &options.rtp_parameters, router_caps)?;

        let producer = Producer::create(self.inner.worker.clone(), self.inner.id, options).await?;
        self.inner.producers.lock().push(producer.clone());
        Ok(producer)
    }

    /// Start sending `producer`'s track to the client
    ///
    /// The caller checks decodability first; this fails with
    /// `IncompatibleCapabilities` if no codec matches.
    pub async fn consume(
        &self,
        producer: &Producer,
        caps: &RtpCapabilities,
        paused: bool,
    ) -> Result<Consumer> {
        if self.is_closed() {
            return Err(Error::TransportNotFound(self.inner.id));
        }

        let identity = ConsumerIdentity {
            mid: self.inner.next_mid.fetch_add(1, Ordering::Relaxed).to_string(),
            ssrc: random_u32(),
            rtx_ssrc: random_u32(),
        };
        let rtp_parameters = consumer_parameters(producer.rtp_parameters(), caps, identity)
            .ok_or(Error::IncompatibleCapabilities(producer.id()))?;

        let consumer = Consumer::create(
            self.inner.worker.clone(),
            self.inner.id,
            producer.clone(),
            rtp_parameters,
            paused,
        )
        .await?;
        self.attach_consumer(&consumer);
        Ok(consumer)
    }

    /// Record a round-trip time measured on this transport
    pub fn record_rtt(&self, rtt: Duration) {
        self.inner.state.lock().rtt = Some(rtt);
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.inner.state.lock().rtt
    }

    /// Close the transport and release its port
    ///
    /// Producers and consumers on it are closed by their owner.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.state.lock().dtls_state = DtlsState::Closed;
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.socket.lock().take();
        self.inner.producers.lock().clear();
        self.inner.egress.lock().pending.clear();
        self.inner.worker.close_transport(self.inner.port);
        tracing::debug!(transport = %self.inner.id, "Transport closed");
    }

    fn socket(&self) -> Option<Arc<MediaSocket>> {
        self.inner.socket.lock().clone()
    }

    fn spawn_receivers(&self) {
        let Some(socket) = self.socket() else {
            return;
        };
        let mut tasks = self.inner.tasks.lock();
        for (index, udp) in socket.sockets() {
            let transport = Arc::downgrade(&self.inner);
            tasks.push(tokio::spawn(receive_loop(udp, index, transport)).abort_handle());
        }
    }

    fn on_datagram(&self, index: usize, from: SocketAddr, datagram: &[u8]) {
        // Nothing is accepted before the client's DTLS parameters arrive
        if !self.is_connected() {
            return;
        }
        let kind = Datagram::classify(datagram);
        if kind == Datagram::Unknown {
            return;
        }

        if let Some(socket) = self.socket() {
            if socket.latch(index, from) {
                tracing::debug!(transport = %self.inner.id, remote = %from, "Client address learned");
                self.start_pending_egress();
            }
        }

        match kind {
            Datagram::Rtp => self.receive_rtp(datagram),
            Datagram::Rtcp => self.receive_rtcp(datagram),
            _ => {}
        }
    }

    fn receive_rtp(&self, datagram: &[u8]) {
        let Some(packet) = RtpPacket::parse(datagram) else {
            tracing::trace!(transport = %self.inner.id, "Malformed RTP packet dropped");
            return;
        };

        let producer = {
            let mut producers = self.inner.producers.lock();
            producers.retain(|p| !p.is_closed());
            producers.iter().find(|p| p.accepts(&packet)).cloned()
        };
        match producer {
            Some(producer) => {
                producer.send(packet);
            }
            None => tracing::trace!(
                transport = %self.inner.id,
                ssrc = packet.ssrc,
                payload_type = packet.payload_type,
                "RTP for unknown stream dropped"
            ),
        }
    }

    fn receive_rtcp(&self, datagram: &[u8]) {
        let arrival = compact_ntp(ntp_now());
        for packet in parse_compound(datagram) {
            for block in packet.report_blocks() {
                if let Some(rtt) = block.round_trip_time(arrival) {
                    self.record_rtt(rtt);
                }
            }
        }
    }

    fn attach_consumer(&self, consumer: &Consumer) {
        if self.socket().is_none() {
            return;
        }
        let mut egress = self.inner.egress.lock();
        if egress.started {
            self.spawn_egress(consumer.clone());
        } else {
            egress.pending.push(consumer.clone());
        }
    }

    fn start_pending_egress(&self) {
        let pending = {
            let mut egress = self.inner.egress.lock();
            egress.started = true;
            std::mem::take(&mut egress.pending)
        };
        for consumer in pending.into_iter().filter(|c| !c.is_closed()) {
            self.spawn_egress(consumer);
        }
    }

    fn spawn_egress(&self, consumer: Consumer) {
        let Some(socket) = self.socket() else {
            return;
        };
        let task = tokio::spawn(egress_loop(consumer, socket));
        self.inner.tasks.lock().push(task.abort_handle());
    }
}

/// Reserve a port from the worker and bind it on every listen address
///
/// Ports another process already holds are skipped and handed back once a
/// free one is found.
async fn open_port(
    worker: &Worker,
    config: &WebRtcTransportConfig,
) -> Result<(u16, Option<MediaSocket>)> {
    if !config.enable_udp {
        return Ok((worker.open_transport().await?, None));
    }

    let mut taken = Vec::new();
    let result = loop {
        let port = match worker.open_transport().await {
            Ok(port) => port,
            Err(e) => break Err(e),
        };
        match MediaSocket::bind(&config.listen_ips, port).await {
            Ok(socket) => break Ok((port, Some(socket))),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::debug!(worker = worker.id(), port, "Port busy, trying the next one");
                taken.push(port);
            }
            Err(e) => {
                worker.close_transport(port);
                break Err(e.into());
            }
        }
    };

    for port in taken {
        worker.close_transport(port);
    }
    result
}

async fn receive_loop(socket: Arc<UdpSocket>, index: usize, transport: Weak<TransportInner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::trace!(error = %e, "Media socket receive failed");
                continue;
            }
        };
        let Some(inner) = transport.upgrade() else {
            break;
        };
        WebRtcTransport { inner }.on_datagram(index, from, &buf[..len]);
    }
}

/// Deliver one consumer's packets to the client, with periodic sender reports
async fn egress_loop(consumer: Consumer, socket: Arc<MediaSocket>) {
    let mut reports = tokio::time::interval(SENDER_REPORT_INTERVAL);
    reports.tick().await;
    let mut rtp_time = 0;

    loop {
        tokio::select! {
            packet = consumer.recv() => {
                let Some(packet) = packet else {
                    break;
                };
                rtp_time = packet.timestamp;
                if let Err(e) = socket.send(&packet.to_bytes()).await {
                    tracing::trace!(consumer = %consumer.id(), error = %e, "RTP send failed");
                }
            }
            _ = reports.tick() => {
                let stats = consumer.stats();
                let Some(ssrc) = consumer.ssrc() else {
                    continue;
                };
                if stats.packets_sent == 0 {
                    continue;
                }
                let report = SenderReport {
                    ssrc,
                    ntp_time: ntp_now(),
                    rtp_time,
                    packet_count: stats.packets_sent as u32,
                    octet_count: stats.bytes_sent as u32,
                    reports: Vec::new(),
                };
                if let Err(e) = socket.send(&report.to_bytes()).await {
                    tracing::trace!(consumer = %consumer.id(), error = %e, "Sender report failed");
                }
            }
        }
    }
}

fn random_token(len: usize) -> String {
    let mut token = Uuid::new_v4().simple().to_string();
    while token.len() < len {
        token.push_str(&Uuid::new_v4().simple().to_string());
    }
    token.truncate(len);
    token
}

fn random_fingerprint() -> String {
    let (high, low) = (Uuid::new_v4(), Uuid::new_v4());
    high.as_bytes()
        .iter()
        .chain(low.as_bytes())
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
