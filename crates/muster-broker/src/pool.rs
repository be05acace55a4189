//! Bounded worker pool for dispatch tasks.
//!
//! A fixed number of workers pull boxed futures off one capacity-bounded
//! queue. Submission awaits queue capacity, so sustained overload shows up
//! as backpressure at the caller instead of unbounded memory growth. A
//! panicking task is contained by its worker; the pool and every other
//! in-flight task keep running.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Error)]
#[error("worker pool closed")]
pub struct PoolClosed;

pub struct WorkerPool {
    queue: mpsc::Sender<Job>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for n in 0..workers.max(1) {
            tokio::spawn(worker(n, rx.clone()));
        }
        Self { queue: tx }
    }

    /// Queue `task` for execution. Blocks while the queue is at capacity.
    pub async fn submit<F>(&self, task: F) -> Result<(), PoolClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.queue.send(Box::pin(task)).await.map_err(|_| PoolClosed)
    }
}

async fn worker(n: usize, queue: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = { queue.lock().await.recv().await };
        let Some(job) = job else { return };

        if std::panic::AssertUnwindSafe(job)
            .catch_unwind()
            .await
            .is_err()
        {
            tracing::warn!(worker = n, "dispatch task panicked");
        }
    }
}
