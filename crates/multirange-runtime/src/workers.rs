//! Worker pool for adapter calls
//!
//! Adapter start/stop can sit on slow hardware paths. A small fixed pool of
//! tokio tasks drains one job queue so those calls never block the session
//! manager's ordered task queue.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

type Job = BoxFuture<'static, ()>;

/// Fixed-size pool of tokio tasks executing boxed jobs in queue order
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<Job>,
}

impl WorkerPool {
    pub const DEFAULT_WORKERS: usize = 4;

    /// Spawn `workers` tasks sharing one job queue
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        for index in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    match job {
                        Some(job) => job.await,
                        None => {
                            debug!(worker = index, "worker pool queue closed");
                            break;
                        }
                    }
                }
            });
        }

        Self { tx }
    }

    /// Enqueue a job; drops it silently once the pool has shut down
    pub fn dispatch<F>(&self, job: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let _ = self.tx.send(Box::pin(job));
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WORKERS)
    }
}
