use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::shutdown::ShutdownSignal;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

const SERIAL_QUEUE_CAPACITY: usize = 2048;

/// Executes submitted jobs one at a time in submission order on a single
/// worker task. The queue is bounded; `submit` suspends when it is full.
pub struct SerialExecutor {
    tx: mpsc::Sender<Job>,
}

impl SerialExecutor {
    pub fn start(name: &str, shutdown: ShutdownSignal) -> Self {
        Self::with_capacity(name, SERIAL_QUEUE_CAPACITY, shutdown)
    }

    pub fn with_capacity(name: &str, capacity: usize, shutdown: ShutdownSignal) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity);
        let tag = name.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    job = rx.recv() => {
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("serial executor {tag} stopping");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    pub async fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Box::pin(job)).await.is_err() {
            warn!("serial executor queue closed, job dropped");
        }
    }

    /// Non-suspending submit; fails when the queue is full or closed.
    pub fn try_submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.try_send(Box::pin(job)).is_ok()
    }
}

/// Fans submitted jobs out over a fixed pool of workers.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
}

impl WorkerPool {
    pub fn start(name: &str, workers: usize, shutdown: ShutdownSignal) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(SERIAL_QUEUE_CAPACITY);
        let rx = std::sync::Arc::new(tokio::sync::Mutex::new(rx));

        for i in 0..workers.max(1) {
            let rx = rx.clone();
            let shutdown = shutdown.clone();
            let tag = format!("{name}-{i}");
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            job = guard.recv() => job,
                            _ = shutdown.cancelled() => None,
                        }
                    };
                    match job {
                        Some(job) => job.await,
                        None => {
                            debug!("worker {tag} stopping");
                            break;
                        }
                    }
                }
            });
        }

        Self { tx }
    }

    pub async fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Box::pin(job)).await.is_err() {
            warn!("worker pool queue closed, job dropped");
        }
    }
}
