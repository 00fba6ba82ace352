//! Router: the media switch of one room

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::media::codec::find_consumable_codec;
use crate::media::{router_capabilities, RtpCapabilities, RtpCodecCapability};

use super::config::WebRtcTransportConfig;
use super::consumer::Consumer;
use super::id::{ProducerId, RouterId};
use super::producer::{Producer, ProducerOptions};
use super::transport::WebRtcTransport;
use super::worker::{Resource, Worker};

struct RouterInner {
    id: RouterId,
    worker: Worker,
    rtp_capabilities: RtpCapabilities,
    transport_config: WebRtcTransportConfig,
    producers: Mutex<HashMap<ProducerId, Producer>>,
    closed: AtomicBool,
}

/// Handle to a router
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("id", &self.inner.id)
            .field("worker", &self.inner.worker.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Router {
    /// Create a router on `worker` supporting `media_codecs`
    pub async fn create(
        worker: Worker,
        media_codecs: &[RtpCodecCapability],
        transport_config: WebRtcTransportConfig,
    ) -> Result<Self> {
        let rtp_capabilities = router_capabilities(media_codecs)?;
        worker.register(Resource::Router).await?;

        let router = Self {
            inner: Arc::new(RouterInner {
                id: RouterId::new(),
                worker,
                rtp_capabilities,
                transport_config,
                producers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        };

        tracing::debug!(
            router = %router.id(),
            worker = router.worker_id(),
            "Router created"
        );

        Ok(router)
    }

    pub fn id(&self) -> RouterId {
        self.inner.id
    }

    pub fn worker_id(&self) -> usize {
        self.inner.worker.id()
    }

    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.inner.rtp_capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub async fn create_webrtc_transport(&self) -> Result<WebRtcTransport> {
        self.ensure_open()?;
        WebRtcTransport::create(
            self.inner.worker.clone(),
            self.inner.id,
            &self.inner.transport_config,
        )
        .await
    }

    /// Create a producer on `transport` and make it consumable in this router
    pub async fn produce(
        &self,
        transport: &WebRtcTransport,
        options: ProducerOptions,
    ) -> Result<Producer> {
        self.ensure_open()?;
        let producer = transport
            .produce(options, &self.inner.rtp_capabilities)
            .await?;
        self.inner
            .producers
            .lock()
            .insert(producer.id(), producer.clone());
        Ok(producer)
    }

    /// Live producer by id
    pub fn producer(&self, id: &ProducerId) -> Option<Producer> {
        let mut producers = self.inner.producers.lock();
        match producers.get(id) {
            Some(producer) if producer.is_closed() => {
                producers.remove(id);
                None
            }
            other => other.cloned(),
        }
    }

    /// Close a producer and stop routing it
    pub fn close_producer(&self, id: &ProducerId) -> Option<Producer> {
        let producer = self.inner.producers.lock().remove(id)?;
        producer.close();
        Some(producer)
    }

    /// Whether a client with `caps` could decode the given producer
    pub fn can_consume(&self, producer_id: &ProducerId, caps: &RtpCapabilities) -> bool {
        match self.producer(producer_id) {
            Some(producer) => find_consumable_codec(producer.rtp_parameters(), caps).is_some(),
            None => false,
        }
    }

    /// Create a consumer of `producer_id` on `transport`
    pub async fn consume(
        &self,
        transport: &WebRtcTransport,
        producer_id: &ProducerId,
        caps: &RtpCapabilities,
        paused: bool,
    ) -> Result<Consumer> {
        self.ensure_open()?;
        let producer = self
            .producer(producer_id)
            .ok_or(Error::ProducerNotFound(*producer_id))?;

        if find_consumable_codec(producer.rtp_parameters(), caps).is_none() {
            return Err(Error::IncompatibleCapabilities(*producer_id));
        }

        transport.consume(&producer, caps, paused).await
    }

    /// Close the router along with every producer still routed through it
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let producers: Vec<Producer> = self
            .inner
            .producers
            .lock()
            .drain()
            .map(|(_, producer)| producer)
            .collect();
        for producer in producers {
            producer.close();
        }

        self.inner.worker.unregister(Resource::Router);
        tracing::debug!(router = %self.inner.id, "Router closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::RouterClosed(self.inner.id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::transport::tests::client_dtls;
    use crate::media::codec::tests::vp8_parameters;
    use crate::media::{default_media_codecs, MediaKind, RtpCodecCapability};

    async fn router() -> Router {
        let (worker, _handle) = Worker::spawn(0, 50_000..=50_099);
        Router::create(worker, &default_media_codecs(), WebRtcTransportConfig::default())
            .await
            .unwrap()
    }

    async fn connected_transport(router: &Router) -> WebRtcTransport {
        let transport = router.create_webrtc_transport().await.unwrap();
        transport.connect(client_dtls()).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_router_capabilities() {
        let router = router().await;
        let caps = router.rtp_capabilities();

        assert!(caps.codecs.iter().any(|c| c.mime_type == "audio/opus"));
        assert!(caps.codecs.iter().any(|c| c.mime_type == "video/VP8"));
        assert!(!caps.header_extensions.is_empty());
    }

    #[tokio::test]
    async fn test_can_consume() {
        let router = router().await;
        let transport = connected_transport(&router).await;
        let producer = router
            .produce(&transport, ProducerOptions::new(MediaKind::Video, vp8_parameters()))
            .await
            .unwrap();

        assert!(router.can_consume(&producer.id(), router.rtp_capabilities()));
        assert!(!router.can_consume(&ProducerId::new(), router.rtp_capabilities()));

        let audio_only = RtpCapabilities {
            codecs: default_media_codecs()
                .into_iter()
                .filter(|c: &RtpCodecCapability| c.kind == MediaKind::Audio)
                .collect(),
            header_extensions: Vec::new(),
        };
        assert!(!router.can_consume(&producer.id(), &audio_only));

        let result = router
            .consume(&transport, &producer.id(), &audio_only, false)
            .await;
        assert!(matches!(result, Err(Error::IncompatibleCapabilities(_))));
    }

    #[tokio::test]
    async fn test_closed_producer_is_not_consumable() {
        let router = router().await;
        let transport = connected_transport(&router).await;
        let producer = router
            .produce(&transport, ProducerOptions::new(MediaKind::Video, vp8_parameters()))
            .await
            .unwrap();

        producer.close();
        assert!(router.producer(&producer.id()).is_none());

        let result = router
            .consume(&transport, &producer.id(), router.rtp_capabilities(), false)
            .await;
        assert!(matches!(result, Err(Error::ProducerNotFound(_))));
    }

    #[tokio::test]
    async fn test_close_closes_producers() {
        let router = router().await;
        let transport = connected_transport(&router).await;
        let producer = router
            .produce(&transport, ProducerOptions::new(MediaKind::Video, vp8_parameters()))
            .await
            .unwrap();

        router.close();

        assert!(router.is_closed());
        assert!(producer.is_closed());
        assert!(matches!(
            router.create_webrtc_transport().await,
            Err(Error::RouterClosed(_))
        ));
    }
}
