//! Fixed pool of long-lived workers draining a [`BoundedQueue`].

use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::queue::BoundedQueue;

/// Processes one queued item to completion.
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    async fn handle(&self, item: T);
}

#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers. Each loops dequeue -> handle until the queue is
    /// closed and drained.
    pub fn spawn<T, H>(size: usize, queue: Arc<BoundedQueue<T>>, handler: Arc<H>) -> Self
    where
        T: Send + 'static,
        H: Handler<T>,
    {
        let workers = (0..size)
            .map(|id| {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    debug!(worker = id, "Worker started");
                    while let Some(item) = queue.dequeue().await {
                        // A panicking item must not take the worker down with it.
                        if AssertUnwindSafe(handler.handle(item))
                            .catch_unwind()
                            .await
                            .is_err()
                        {
                            error!(worker = id, "Handler panicked; worker continues");
                        }
                    }
                    debug!(worker = id, "Worker stopped");
                })
            })
            .collect();

        Self { workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to finish. Workers only finish after the queue is closed.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {}", e);
            }
        }
    }
}
