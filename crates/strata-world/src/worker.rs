//! Bounded worker pool for chunk load, save and generation jobs.
//!
//! Jobs are queued on a bounded crossbeam channel shared by a fixed set of
//! named threads. Each job carries a [`CancelToken`]; a job cancelled while
//! still queued is skipped, and a running job may poll the token and bail.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, TrySendError, bounded};

/// Shared cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueuedJob {
    job: Job,
    cancelled: CancelToken,
}

/// Errors produced by the pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker queue is full")]
    QueueFull,
    #[error("worker pool has shut down")]
    ShutDown,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Fixed-size thread pool.
pub struct WorkerPool {
    sender: Option<Sender<QueuedJob>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Spawns `thread_count` workers named `strata-io-N` sharing a queue of
    /// `queue_capacity` jobs.
    pub fn new(thread_count: usize, queue_capacity: usize) -> Result<Self, PoolError> {
        let (sender, receiver) = bounded::<QueuedJob>(queue_capacity.max(1));
        let in_flight = Arc::new(AtomicU64::new(0));
        let mut workers = Vec::with_capacity(thread_count);

        for index in 0..thread_count.max(1) {
            let receiver = receiver.clone();
            let in_flight = Arc::clone(&in_flight);
            let handle = std::thread::Builder::new()
                .name(format!("strata-io-{index}"))
                .spawn(move || {
                    while let Ok(queued) = receiver.recv() {
                        if !queued.cancelled.is_cancelled() {
                            (queued.job)();
                        }
                        in_flight.fetch_sub(1, Ordering::AcqRel);
                    }
                })?;
            workers.push(handle);
        }

        tracing::debug!(threads = workers.len(), queue_capacity, "worker pool started");
        Ok(Self {
            sender: Some(sender),
            workers,
            in_flight,
        })
    }

    /// Pool sized from the CPU count, leaving room for the simulation and
    /// network threads. A configured count of 0 means "derive".
    pub fn with_threads(configured: usize) -> Result<Self, PoolError> {
        let threads = if configured > 0 {
            configured
        } else {
            let cpus = num_cpus::get().max(2);
            (cpus - 2).clamp(1, 4)
        };
        Self::new(threads, 256)
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), PoolError> {
        self.submit_cancellable(CancelToken::new(), job)
    }

    /// Queues a job that is skipped if `token` is cancelled before it starts.
    pub fn submit_cancellable(
        &self,
        token: CancelToken,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<(), PoolError> {
        let sender = self.sender.as_ref().ok_or(PoolError::ShutDown)?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let queued = QueuedJob {
            job: Box::new(job),
            cancelled: token,
        };
        sender.try_send(queued).map_err(|e| {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            match e {
                TrySendError::Full(_) => PoolError::QueueFull,
                TrySendError::Disconnected(_) => PoolError::ShutDown,
            }
        })
    }

    /// Jobs queued or executing.
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting jobs, lets queued ones finish, and joins the workers.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_jobs_run_on_workers() {
        let pool = WorkerPool::new(2, 16).unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..8 {
            let tx = tx.clone();
            pool.submit(move || {
                let name = std::thread::current().name().map(str::to_owned);
                let _ = tx.send((i, name));
            })
            .unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..8 {
            let (i, name) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            assert!(name.unwrap().starts_with("strata-io-"));
            seen.push(i);
        }
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_cancelled_job_is_skipped() {
        let pool = WorkerPool::new(1, 16).unwrap();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        // Block the single worker so the second job stays queued.
        pool.submit(move || {
            let _ = gate_rx.recv();
        })
        .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let token = CancelToken::new();
        let flag = Arc::clone(&ran);
        pool.submit_cancellable(token.clone(), move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        token.cancel();
        token.cancel();
        let _ = gate_tx.send(());

        wait_until(|| pool.in_flight_count() == 0);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_full_queue_rejects() {
        let pool = WorkerPool::new(1, 1).unwrap();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        pool.submit(move || {
            let _ = gate_rx.recv();
        })
        .unwrap();
        // Wait for the worker to pick up the blocking job.
        wait_until(|| pool.sender.as_ref().is_some_and(|s| s.is_empty()));
        pool.submit(|| {}).unwrap();
        assert!(matches!(pool.submit(|| {}), Err(PoolError::QueueFull)));
        let _ = gate_tx.send(());
    }

    #[test]
    fn test_shutdown_rejects_new_jobs() {
        let mut pool = WorkerPool::new(1, 4).unwrap();
        pool.shutdown();
        assert!(matches!(pool.submit(|| {}), Err(PoolError::ShutDown)));
    }

    #[test]
    fn test_with_threads_derives_count() {
        let pool = WorkerPool::with_threads(0).unwrap();
        assert!(pool.thread_count() >= 1);
        let pool = WorkerPool::with_threads(3).unwrap();
        assert_eq!(pool.thread_count(), 3);
    }
}
