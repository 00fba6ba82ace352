//! Media worker
//!
//! A worker is an isolated engine task that owns a contiguous port range and
//! the resource accounting for everything created on it. Handles talk to it
//! over a request channel; once the task is gone every request fails with
//! `Error::WorkerFatal`.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::{Error, Result};

/// Engine objects tracked per worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resource {
    Router,
    Producer,
    Consumer,
}

pub(crate) enum WorkerRequest {
    Register {
        resource: Resource,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        resource: Resource,
    },
    OpenTransport {
        reply: oneshot::Sender<Result<u16>>,
    },
    CloseTransport {
        port: u16,
    },
    Dump {
        reply: oneshot::Sender<WorkerDump>,
    },
    Close,
}

/// Snapshot of what a worker is currently holding
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDump {
    pub worker_id: usize,
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub ports_in_use: usize,
    pub port_range: (u16, u16),
}

struct WorkerInner {
    id: usize,
    port_range: RangeInclusive<u16>,
    tx: mpsc::UnboundedSender<WorkerRequest>,
    closed: AtomicBool,
    abort: AbortHandle,
}

/// Handle to a media worker
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("port_range", &self.inner.port_range)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Worker {
    /// Start a worker task bound to `port_range`
    ///
    /// The returned handle completes when the task exits; callers watch it
    /// to detect unexpected death.
    pub(crate) fn spawn(id: usize, port_range: RangeInclusive<u16>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = WorkerState::new(id, port_range.clone());
        let handle = tokio::spawn(state.run(rx));

        tracing::info!(
            worker = id,
            min_port = *port_range.start(),
            max_port = *port_range.end(),
            "Worker started"
        );

        let worker = Self {
            inner: Arc::new(WorkerInner {
                id,
                port_range,
                tx,
                closed: AtomicBool::new(false),
                abort: handle.abort_handle(),
            }),
        };

        (worker, handle)
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.inner.port_range.clone()
    }

    /// Whether the worker task is still accepting requests
    pub fn is_alive(&self) -> bool {
        !self.inner.tx.is_closed() && !self.inner.abort.is_finished()
    }

    /// Whether the worker was shut down on purpose
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Shut the worker down
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            let _ = self.inner.tx.send(WorkerRequest::Close);
            tracing::info!(worker = self.inner.id, "Worker closed");
        }
    }

    /// Current resource usage
    pub async fn dump(&self) -> Result<WorkerDump> {
        self.request(|reply| WorkerRequest::Dump { reply }).await
    }

    pub(crate) async fn register(&self, resource: Resource) -> Result<()> {
        self.request(|reply| WorkerRequest::Register { resource, reply })
            .await
    }

    pub(crate) fn unregister(&self, resource: Resource) {
        let _ = self.inner.tx.send(WorkerRequest::Unregister { resource });
    }

    pub(crate) async fn open_transport(&self) -> Result<u16> {
        self.request(|reply| WorkerRequest::OpenTransport { reply })
            .await?
    }

    pub(crate) fn close_transport(&self, port: u16) {
        let _ = self.inner.tx.send(WorkerRequest::CloseTransport { port });
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerRequest,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(build(reply))
            .map_err(|_| Error::WorkerFatal(self.inner.id))?;
        rx.await.map_err(|_| Error::WorkerFatal(self.inner.id))
    }

    /// Kill the task without going through `close`, as a crash would
    #[cfg(test)]
    pub(crate) fn kill(&self) {
        self.inner.abort.abort();
    }
}

struct WorkerState {
    id: usize,
    port_range: RangeInclusive<u16>,
    ports_in_use: HashSet<u16>,
    next_port: u16,
    routers: usize,
    transports: usize,
    producers: usize,
    consumers: usize,
}

impl WorkerState {
    fn new(id: usize, port_range: RangeInclusive<u16>) -> Self {
        Self {
            id,
            next_port: *port_range.start(),
            port_range,
            ports_in_use: HashSet::new(),
            routers: 0,
            transports: 0,
            producers: 0,
            consumers: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerRequest>) {
        while let Some(request) = rx.recv().await {
            match request {
                WorkerRequest::Register { resource, reply } => {
                    *self.counter(resource) += 1;
                    let _ = reply.send(());
                }
                WorkerRequest::Unregister { resource } => {
                    let counter = self.counter(resource);
                    *counter = counter.saturating_sub(1);
                }
                WorkerRequest::OpenTransport { reply } => {
                    let result = self.allocate_port();
                    if result.is_ok() {
                        self.transports += 1;
                    }
                    let _ = reply.send(result);
                }
                WorkerRequest::CloseTransport { port } => {
                    if self.ports_in_use.remove(&port) {
                        self.transports = self.transports.saturating_sub(1);
                    }
                }
                WorkerRequest::Dump { reply } => {
                    let _ = reply.send(self.dump());
                }
                WorkerRequest::Close => break,
            }
        }

        tracing::debug!(worker = self.id, "Worker task finished");
    }

    fn counter(&mut self, resource: Resource) -> &mut usize {
        match resource {
            Resource::Router => &mut self.routers,
            Resource::Producer => &mut self.producers,
            Resource::Consumer => &mut self.consumers,
        }
    }

    fn allocate_port(&mut self) -> Result<u16> {
        let start = *self.port_range.start();
        let end = *self.port_range.end();
        let size = end as usize - start as usize + 1;

        for _ in 0..size {
            let port = self.next_port;
            self.next_port = if port >= end { start } else { port + 1 };

            if self.ports_in_use.insert(port) {
                return Ok(port);
            }
        }

        tracing::warn!(worker = self.id, "Port range exhausted");
        Err(Error::PortsExhausted(self.id))
    }

    fn dump(&self) -> WorkerDump {
        WorkerDump {
            worker_id: self.id,
            routers: self.routers,
            transports: self.transports,
            producers: self.producers,
            consumers: self.consumers,
            ports_in_use: self.ports_in_use.len(),
            port_range: (*self.port_range.start(), *self.port_range.end()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[tokio::test]
    async fn test_port_allocation_and_release() {
        let (worker, _handle) = Worker::spawn(0, 20_000..=20_001);

        let a = worker.open_transport().await.unwrap();
        let b = worker.open_transport().await.unwrap();
        assert_ne!(a, b);

        let result = worker.open_transport().await;
        assert!(matches!(result, Err(Error::PortsExhausted(0))));

        worker.close_transport(a);
        let c = worker.open_transport().await.unwrap();
        assert_eq!(c, a);

        let dump = worker.dump().await.unwrap();
        assert_eq!(dump.transports, 2);
        assert_eq!(dump.ports_in_use, 2);
    }

    #[tokio::test]
    async fn test_resource_accounting() {
        let (worker, _handle) = Worker::spawn(3, 20_000..=20_010);

        worker.register(Resource::Router).await.unwrap();
        worker.register(Resource::Producer).await.unwrap();
        worker.register(Resource::Producer).await.unwrap();
        worker.unregister(Resource::Producer);

        let dump = worker.dump().await.unwrap();
        assert_eq!(dump.worker_id, 3);
        assert_eq!(dump.routers, 1);
        assert_eq!(dump.producers, 1);
        assert_eq!(dump.consumers, 0);
    }

    #[tokio::test]
    async fn test_requests_fail_after_close() {
        let (worker, handle) = Worker::spawn(1, 20_000..=20_010);

        worker.close();
        handle.await.unwrap();

        assert!(worker.is_closed());
        assert!(!worker.is_alive());
        assert_err!(worker.dump().await);
        let result = worker.open_transport().await;
        assert!(matches!(result, Err(ref e) if e.is_fatal()));
    }

    #[tokio::test]
    async fn test_killed_worker_is_not_closed() {
        let (worker, handle) = Worker::spawn(2, 20_000..=20_010);

        worker.kill();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert!(!worker.is_closed());
        assert!(!worker.is_alive());
        assert!(matches!(worker.dump().await, Err(Error::WorkerFatal(2))));
    }
}
