//! Bounded worker pools.
//!
//! ```text
//! submit ──► [ bounded queue ] ──► worker 1
//!                              ├─► worker 2
//!                              └─► worker N
//! ```
//!
//! `submit` never waits: a full queue fails with [`PoolError::Saturated`] so
//! callers can shed load immediately. REST and pub/sub each own a pool, so a
//! backlog on one channel cannot starve the other.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, info};

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PoolError {
    #[error("worker pool queue is full")]
    Saturated,
    #[error("worker pool is shut down")]
    Closed,
}

#[derive(Debug, Default)]
struct PoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub rejected: u64,
    pub queued: usize,
}

/// Fixed set of tasks draining a bounded job queue.
pub struct WorkerPool {
    name: &'static str,
    sender: Mutex<Option<flume::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `workers` tasks on the current runtime.
    pub fn new(name: &'static str, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = flume::bounded::<Job>(capacity.max(1));
        let stats = Arc::new(PoolStats::default());
        let handles = (0..workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    while let Ok(job) = rx.recv_async().await {
                        job.await;
                        stats.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(pool = name, worker = id, "worker stopped");
                })
            })
            .collect();
        info!(pool = name, workers, capacity, "worker pool started");
        Self {
            name,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            stats,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue `job` without waiting.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.sender.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(PoolError::Closed);
        };
        match tx.try_send(Box::pin(job)) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(flume::TrySendError::Full(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::Saturated)
            }
            Err(flume::TrySendError::Disconnected(_)) => Err(PoolError::Closed),
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            queued: self.sender.lock().as_ref().map_or(0, |tx| tx.len()),
        }
    }

    /// Stop accepting work, let queued jobs finish and wait for the workers.
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!(pool = self.name, "worker pool drained");
    }
}
