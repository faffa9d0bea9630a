//! Off-network-queue execution: a bounded crypto pool and a serial file-IO worker.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("worker failure: {0}")]
pub struct WorkerError(pub String);

/// Runs CPU-bound jobs on the blocking pool, at most `workers` at a time.
#[derive(Debug, Clone)]
pub struct CryptoPool {
    permits: Arc<Semaphore>,
}

impl CryptoPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub async fn run<T, F>(&self, job: F) -> Result<T, WorkerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| WorkerError(format!("crypto pool closed: {e}")))?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| WorkerError(format!("crypto job failed: {e}")))
    }
}

type FileJob = Box<dyn FnOnce() + Send + 'static>;

/// A single worker that performs file writes strictly in submission order.
#[derive(Debug, Clone)]
pub struct FileIo {
    tx: mpsc::UnboundedSender<FileJob>,
}

impl FileIo {
    /// Spawn the worker task. Must be called within a tokio runtime.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<FileJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(err) = tokio::task::spawn_blocking(job).await {
                    warn!(%err, "file job panicked");
                }
            }
        });
        Self { tx }
    }

    /// Queue `job`; the receiver resolves with its output once it ran.
    pub fn submit<T, F>(&self, job: F) -> oneshot::Receiver<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let wrapped: FileJob = Box::new(move || {
            let _ = done_tx.send(job());
        });
        if self.tx.send(wrapped).is_err() {
            warn!("file worker is gone; job dropped");
        }
        done_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn crypto_pool_returns_job_output() {
        let pool = CryptoPool::new(2);
        let value = pool.run(|| 6 * 7).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn crypto_pool_bounds_concurrency() {
        let pool = CryptoPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn file_jobs_run_in_order() {
        let io = FileIo::start();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut receivers = Vec::new();
        for i in 0..5 {
            let log = log.clone();
            receivers.push(io.submit(move || {
                std::thread::sleep(Duration::from_millis((5 - i) * 2));
                log.lock().unwrap().push(i);
                i
            }));
        }
        for (i, rx) in receivers.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap(), i as u64);
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
