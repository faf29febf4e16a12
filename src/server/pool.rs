//! Bounded worker pool
//!
//! Jobs wait in a FIFO queue of fixed capacity and are taken by the first
//! idle worker. Each job runs on the blocking thread pool, so no more than
//! `workers` conversions are ever in flight. A worker only dequeues its next
//! job after the previous one has returned, successfully or not.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::ValueEnum;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::server::error::{Result, ServerError};

/// What `submit` does when the queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueueFullPolicy {
    /// Wait for a queue slot
    Block,
    /// Fail immediately with `ServerError::QueueFull`
    Reject,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub queue_full: QueueFullPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            queue_capacity: 32,
            queue_full: QueueFullPolicy::Block,
        }
    }
}

/// Point-in-time view of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSnapshot {
    pub active: usize,
    pub peak: usize,
    pub queued: usize,
    pub completed: usize,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    peak: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicUsize,
}

impl Counters {
    fn job_started(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
    }

    fn job_finished(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            active: self.active.load(Ordering::SeqCst),
            peak: self.peak.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
        }
    }
}

type Task = Box<dyn FnOnce(CancellationToken) + Send + 'static>;

pub struct WorkerPool {
    sender: mpsc::Sender<Task>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    config: PoolConfig,
}

impl WorkerPool {
    /// Starts the worker tasks. Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        let config = PoolConfig {
            workers: config.workers.max(1),
            queue_capacity: config.queue_capacity.max(1),
            ..config
        };
        let (sender, receiver) = mpsc::channel::<Task>(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());
        let cancel = CancellationToken::new();

        let workers = (0..config.workers)
            .map(|id| tokio::spawn(worker_loop(id, receiver.clone(), counters.clone(), cancel.clone())))
            .collect::<Vec<_>>();
        let workers = std::sync::Mutex::new(workers);

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            policy = ?config.queue_full,
            "Worker pool started"
        );

        Self {
            sender,
            workers,
            counters,
            cancel,
            config,
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.counters.snapshot()
    }

    /// Queues `job` and returns a receiver for its result.
    ///
    /// The job gets a token that is cancelled when the pool shuts down. If
    /// the job panics the receiver reports a closed channel.
    pub async fn submit<F, T>(&self, job: F) -> Result<oneshot::Receiver<T>>
    where
        F: FnOnce(CancellationToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(ServerError::PoolClosed);
        }

        let (tx, rx) = oneshot::channel();
        let task: Task = Box::new(move |cancel| {
            let _ = tx.send(job(cancel));
        });

        let permit = match self.config.queue_full {
            QueueFullPolicy::Block => self.sender.reserve().await.map_err(|_| ServerError::PoolClosed)?,
            QueueFullPolicy::Reject => self.sender.try_reserve().map_err(|e| match e {
                mpsc::error::TrySendError::Full(()) => ServerError::QueueFull,
                mpsc::error::TrySendError::Closed(()) => ServerError::PoolClosed,
            })?,
        };
        // Counted once a slot is held, before any worker can see the task
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        permit.send(task);
        Ok(rx)
    }

    /// Stops accepting jobs, signals running ones and waits for the workers.
    ///
    /// Jobs still waiting in the queue are dropped without running, so their
    /// result receivers report a closed channel.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers = self
            .workers
            .lock()
            .map(|mut workers| std::mem::take(&mut *workers))
            .unwrap_or_default();
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker task failed: {}", e);
            }
        }
        let snapshot = self.counters.snapshot();
        info!(
            completed = snapshot.completed,
            peak = snapshot.peak,
            dropped = snapshot.queued,
            "Worker pool stopped"
        );
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    loop {
        let task = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                task = receiver.recv() => task,
            }
        };
        let Some(task) = task else {
            break;
        };

        counters.job_started();
        debug!(worker = id, "Job started");

        let token = cancel.child_token();
        let outcome = tokio::task::spawn_blocking(move || task(token)).await;

        counters.job_finished();
        match outcome {
            Ok(()) => debug!(worker = id, "Job finished"),
            Err(e) => error!(worker = id, "Job panicked: {}", e),
        }
    }
    debug!(worker = id, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::RwLock;
    use std::time::Duration;

    fn pool(workers: usize, queue_capacity: usize, queue_full: QueueFullPolicy) -> WorkerPool {
        WorkerPool::new(PoolConfig {
            workers,
            queue_capacity,
            queue_full,
        })
    }

    async fn wait_until(pool: &WorkerPool, condition: impl Fn(PoolSnapshot) -> bool) -> PoolSnapshot {
        for _ in 0..500 {
            let snapshot = pool.snapshot();
            if condition(snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached the expected state: {:?}", pool.snapshot());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_active_jobs_never_exceed_workers() {
        let pool = pool(3, 16, QueueFullPolicy::Block);
        let gate = Arc::new(RwLock::new(()));
        let held = gate.write().unwrap();

        let mut results = Vec::new();
        for i in 0..8 {
            let gate = gate.clone();
            results.push(
                pool.submit(move |_| {
                    let _open = gate.read().unwrap();
                    i
                })
                .await
                .unwrap(),
            );
        }

        let snapshot = wait_until(&pool, |s| s.active == 3).await;
        assert_eq!(snapshot.queued, 5);
        assert_eq!(snapshot.completed, 0);

        drop(held);
        for (i, rx) in results.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap(), i);
        }

        let snapshot = wait_until(&pool, |s| s.completed == 8).await;
        assert_eq!(snapshot.peak, 3);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.queued, 0);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_worker_runs_in_submission_order() {
        let pool = pool(1, 8, QueueFullPolicy::Block);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut results = Vec::new();
        for i in 0..6 {
            let order = order.clone();
            results.push(pool.submit(move |_| order.lock().unwrap().push(i)).await.unwrap());
        }
        for rx in results {
            rx.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_job_frees_its_slot() {
        let pool = pool(1, 4, QueueFullPolicy::Block);

        let failing = pool.submit(|_| -> u32 { panic!("decoder blew up") }).await.unwrap();
        let following = pool.submit(|_| 7u32).await.unwrap();

        assert!(failing.await.is_err());
        assert_eq!(following.await.unwrap(), 7);

        let snapshot = wait_until(&pool, |s| s.completed == 2).await;
        assert_eq!(snapshot.active, 0);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reject_policy_when_queue_full() {
        let pool = pool(1, 1, QueueFullPolicy::Reject);
        let gate = Arc::new(RwLock::new(()));
        let held = gate.write().unwrap();

        let gate_a = gate.clone();
        let running = pool.submit(move |_| drop(gate_a.read().unwrap())).await.unwrap();
        wait_until(&pool, |s| s.active == 1).await;

        let gate_b = gate.clone();
        let queued = pool.submit(move |_| drop(gate_b.read().unwrap())).await.unwrap();

        let rejected = pool.submit(|_| ()).await;
        assert!(matches!(rejected, Err(ServerError::QueueFull)));

        drop(held);
        running.await.unwrap();
        queued.await.unwrap();
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_policy_waits_for_slot() {
        let pool = Arc::new(pool(1, 1, QueueFullPolicy::Block));
        let gate = Arc::new(RwLock::new(()));
        let held = gate.write().unwrap();

        let gate_a = gate.clone();
        let first = pool.submit(move |_| drop(gate_a.read().unwrap())).await.unwrap();
        wait_until(&pool, |s| s.active == 1).await;
        let gate_b = gate.clone();
        let second = pool.submit(move |_| drop(gate_b.read().unwrap())).await.unwrap();

        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(|_| 3u8).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        drop(held);
        first.await.unwrap();
        second.await.unwrap();
        let third = blocked.await.unwrap().unwrap();
        assert_eq!(third.await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiting_submitter_is_not_counted_as_queued() {
        let pool = Arc::new(pool(1, 1, QueueFullPolicy::Block));
        let gate = Arc::new(RwLock::new(()));
        let held = gate.write().unwrap();

        let gate_a = gate.clone();
        let first = pool.submit(move |_| drop(gate_a.read().unwrap())).await.unwrap();
        wait_until(&pool, |s| s.active == 1).await;
        let gate_b = gate.clone();
        let second = pool.submit(move |_| drop(gate_b.read().unwrap())).await.unwrap();
        assert_eq!(pool.snapshot().queued, 1);

        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(|_| ()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert_eq!(pool.snapshot().queued, 1);

        drop(held);
        first.await.unwrap();
        second.await.unwrap();
        blocked.await.unwrap().unwrap().await.unwrap();
        let snapshot = wait_until(&pool, |s| s.completed == 3).await;
        assert_eq!(snapshot.queued, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_signal() {
        let pool = pool(1, 1, QueueFullPolicy::Block);
        pool.cancel.cancel();
        assert!(matches!(pool.submit(|_| ()).await, Err(ServerError::PoolClosed)));
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_cancels_running_job() {
        let pool = pool(1, 1, QueueFullPolicy::Block);
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let result = pool
            .submit(move |cancel| {
                started_tx.send(()).unwrap();
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                "cancelled"
            })
            .await
            .unwrap();

        tokio::task::spawn_blocking(move || started_rx.recv().unwrap()).await.unwrap();
        pool.shutdown().await;
        assert_eq!(result.await.unwrap(), "cancelled");
    }
}
