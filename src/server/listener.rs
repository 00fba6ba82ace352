//! SFU server listener
//!
//! Owns the worker pool, room registry and quality monitor, runs the TCP
//! accept loop and spawns a handler per signaling connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinError;

use crate::config::SfuConfig;
use crate::engine::WorkerPool;
use crate::error::{Error, Result};
use crate::registry::RoomRegistry;
use crate::server::connection::Connection;
use crate::stats::{QualityMonitor, ServerStats};

#[derive(Debug, Default)]
struct ConnectionCounters {
    total: AtomicU64,
    active: AtomicU64,
}

/// Selective forwarding media server
pub struct SfuServer {
    config: SfuConfig,
    pool: Arc<WorkerPool>,
    registry: Arc<RoomRegistry>,
    monitor: Arc<QualityMonitor>,
    next_connection_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    counters: Arc<ConnectionCounters>,
    started_at: Instant,
}

impl SfuServer {
    /// Validate the configuration and start the worker pool
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: SfuConfig) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(WorkerPool::create(&config.worker)?);
        let registry = Arc::new(RoomRegistry::new(
            Arc::clone(&pool),
            config.media_codecs.clone(),
            config.webrtc_transport.clone(),
            config.registry.clone(),
        ));
        let monitor = Arc::new(QualityMonitor::new(
            Arc::clone(&registry),
            config.monitor.clone(),
        ));

        let connection_semaphore = if config.server.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.server.max_connections)))
        } else {
            None
        };

        Ok(Self {
            config,
            pool,
            registry,
            monitor,
            next_connection_id: AtomicU64::new(1),
            connection_semaphore,
            counters: Arc::new(ConnectionCounters::default()),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Get a reference to the room registry
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<QualityMonitor> {
        &self.monitor
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.server.bind_addr
    }

    /// Server-wide counters
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total.load(Ordering::Relaxed),
            active_connections: self.counters.active.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count().await as u64,
            uptime: self.started_at.elapsed(),
        }
    }

    /// Run the server
    ///
    /// Returns only on error, including the death of a media worker.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.server.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            addr = %listener.local_addr()?,
            workers = self.pool.len(),
            "SFU signaling server listening"
        );

        let cleanup_handle = self.registry.spawn_cleanup_task();
        let monitor_handle = self
            .config
            .monitor
            .enabled
            .then(|| self.monitor.spawn());

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
            death = self.pool.worker_died() => {
                let grace = self.config.worker.death_grace_period;
                tracing::error!(
                    worker = death.worker_id,
                    reason = %death.reason,
                    grace_ms = grace.as_millis() as u64,
                    "Media worker died, shutting down"
                );
                tokio::time::sleep(grace).await;
                Err(Error::WorkerFatal(death.worker_id))
            }
        };

        cleanup_handle.abort();
        if let Some(handle) = monitor_handle {
            handle.abort();
        }
        self.pool.close();

        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(connection = connection_id, peer = %peer_addr, "New connection");

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let connection = Connection::new(
            connection_id,
            socket,
            peer_addr,
            self.config.server.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.monitor),
        );
        let peer_id = connection.peer_id().to_string();
        let registry = Arc::clone(&self.registry);
        let counters = Arc::clone(&self.counters);
        counters.total.fetch_add(1, Ordering::Relaxed);
        counters.active.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let _permit = permit;

            // A separate task, so a panic while serving still reaches the cleanup below
            let served = tokio::spawn(connection.run()).await;
            settle_connection(connection_id, &peer_id, &registry, served).await;

            counters.active.fetch_sub(1, Ordering::Relaxed);
        });
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.server.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }
}

/// Log how a connection task ended
///
/// A task that panicked or was cancelled never ran its own disconnect, so
/// its peer is removed from the registry here.
async fn settle_connection(
    connection_id: u64,
    peer_id: &str,
    registry: &RoomRegistry,
    served: std::result::Result<Result<()>, JoinError>,
) {
    match served {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(connection = connection_id, error = %e, "Connection error");
        }
        Err(e) => {
            tracing::error!(
                connection = connection_id,
                peer = %peer_id,
                error = %e,
                "Connection task aborted, releasing peer"
            );
            if let Some(room_id) = registry.room_of(peer_id).await {
                registry.remove_peer(&room_id, peer_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::engine::{WebRtcTransportConfig, WorkerSettings};
    use crate::media::default_media_codecs;
    use crate::registry::RegistryConfig;

    fn registry() -> RoomRegistry {
        let settings = WorkerSettings::default().num_workers(1).port_range(46_000, 46_099);
        RoomRegistry::new(
            Arc::new(WorkerPool::create(&settings).unwrap()),
            default_media_codecs(),
            WebRtcTransportConfig::default(),
            RegistryConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_panicked_connection_releases_peer() {
        let registry = registry();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.join_room("room-1", "a", None, tx_a).await.unwrap();
        registry.join_room("room-1", "b", None, tx_b).await.unwrap();

        let served: std::result::Result<Result<()>, JoinError> =
            tokio::spawn(async { panic!("handler bug") }).await;
        assert!(served.as_ref().is_err_and(|e| e.is_panic()));
        settle_connection(1, "a", &registry, served).await;

        assert!(registry.room_of("a").await.is_none());
        assert_eq!(registry.room_stats("room-1").await.unwrap().peer_count, 1);
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            crate::registry::Notification::PeerLeft { peer_id } if peer_id == "a"
        ));
    }

    #[tokio::test]
    async fn test_finished_connection_is_left_alone() {
        let registry = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.join_room("room-1", "a", None, tx).await.unwrap();

        settle_connection(1, "a", &registry, Ok(Err(Error::NotJoined))).await;
        assert_eq!(registry.room_of("a").await.as_deref(), Some("room-1"));
    }
}
