//! Worker pool
//!
//! Spawns the configured number of workers on disjoint port ranges, hands
//! them out round-robin and reports any worker that exits without having
//! been closed.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};

use super::config::WorkerSettings;
use super::worker::{Worker, WorkerDump};

/// Notice that a worker exited unexpectedly
#[derive(Debug, Clone)]
pub struct WorkerDeath {
    pub worker_id: usize,
    pub reason: String,
}

/// Pool of media workers
pub struct WorkerPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
    deaths: Mutex<mpsc::UnboundedReceiver<WorkerDeath>>,
}

impl WorkerPool {
    /// Start `settings.num_workers` workers
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(settings: &WorkerSettings) -> Result<Self> {
        settings.validate()?;

        let (death_tx, death_rx) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(settings.num_workers);

        for (id, range) in settings.worker_port_ranges().into_iter().enumerate() {
            let (worker, handle) = Worker::spawn(id, range);

            let watched = worker.clone();
            let death_tx = death_tx.clone();
            tokio::spawn(async move {
                let outcome = handle.await;
                if watched.is_closed() {
                    return;
                }

                let reason = match outcome {
                    Ok(()) => "exited".to_string(),
                    Err(e) if e.is_panic() => "panicked".to_string(),
                    Err(_) => "aborted".to_string(),
                };
                tracing::error!(worker = watched.id(), reason = %reason, "Worker died");
                let _ = death_tx.send(WorkerDeath {
                    worker_id: watched.id(),
                    reason,
                });
            });

            workers.push(worker);
        }

        tracing::info!(workers = workers.len(), "Worker pool started");

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            deaths: Mutex::new(death_rx),
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Next worker in round-robin order
    pub fn acquire_worker(&self) -> Result<Worker> {
        if self.workers.is_empty() {
            return Err(Error::Config("worker pool is empty".into()));
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[index];
        if !worker.is_alive() {
            return Err(Error::WorkerFatal(worker.id()));
        }
        Ok(worker.clone())
    }

    /// Wait for the first unexpected worker exit
    ///
    /// Pends forever if every worker is closed normally.
    pub async fn worker_died(&self) -> WorkerDeath {
        let mut deaths = self.deaths.lock().await;
        match deaths.recv().await {
            Some(death) => death,
            None => std::future::pending().await,
        }
    }

    /// Resource usage of every live worker
    pub async fn dump(&self) -> Vec<WorkerDump> {
        let mut dumps = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            if let Ok(dump) = worker.dump().await {
                dumps.push(dump);
            }
        }
        dumps
    }

    /// Shut every worker down
    pub fn close(&self) {
        for worker in &self.workers {
            worker.close();
        }
    }
}
