//! Bounded pool of crypto worker threads.
//!
//! The pool owns exactly `size` OS threads. Callers `acquire` a
//! [`WorkerHandle`] (FIFO, via a fair semaphore), ship closures to it with
//! [`WorkerHandle::run`], and give it back by dropping it or calling
//! [`CryptoWorkerPool::release`]. Workers keep no state between jobs.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::UploadError;

pub const MAX_DEFAULT_POOL_SIZE: usize = 4;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("crypto worker {0} panicked")]
    Panicked(usize),
    #[error("crypto worker {0} is gone")]
    Gone(usize),
}

pub fn default_pool_size() -> usize {
    num_cpus::get().clamp(1, MAX_DEFAULT_POOL_SIZE)
}

#[derive(Clone)]
pub struct CryptoWorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    size: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<usize>>,
    senders: Mutex<Vec<Option<std_mpsc::Sender<Job>>>>,
}

pub struct WorkerHandle {
    index: usize,
    jobs: std_mpsc::Sender<Job>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl CryptoWorkerPool {
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let mut senders = Vec::with_capacity(size);
        for index in 0..size {
            let (tx, rx) = std_mpsc::channel::<Job>();
            thread::Builder::new()
                .name(format!("crypto-worker-{index}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    debug!(worker = index, "crypto worker exiting");
                })?;
            senders.push(Some(tx));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                size,
                permits: Arc::new(Semaphore::new(size)),
                idle: Mutex::new((0..size).collect()),
                senders: Mutex::new(senders),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Handles currently held by callers.
    pub fn outstanding(&self) -> usize {
        if self.inner.permits.is_closed() {
            return self.inner.size - self.idle_len();
        }
        self.inner.size - self.inner.permits.available_permits()
    }

    fn idle_len(&self) -> usize {
        self.inner.idle.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Waits for a free worker. Waiters are served in arrival order.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<WorkerHandle, UploadError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            p = self.inner.permits.clone().acquire_owned() => {
                p.map_err(|_| UploadError::PoolExhausted)?
            }
        };
        let index = self
            .inner
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop_front())
            .ok_or(UploadError::PoolExhausted)?;
        let jobs = self
            .inner
            .senders
            .lock()
            .ok()
            .and_then(|s| s.get(index).cloned().flatten())
            .ok_or(UploadError::PoolExhausted)?;
        Ok(WorkerHandle {
            index,
            jobs,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    pub fn release(&self, handle: WorkerHandle) {
        drop(handle);
    }

    /// Tears the pool down. Pending and future `acquire` calls fail with
    /// `PoolExhausted`; threads exit once outstanding handles are dropped.
    pub fn shutdown(&self) {
        self.inner.permits.close();
        if let Ok(mut senders) = self.inner.senders.lock() {
            for s in senders.iter_mut() {
                s.take();
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.permits.is_closed()
    }
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Runs `job` on this worker's thread.
    pub async fn run<F, R>(&self, job: F) -> Result<R, WorkerError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: Job = Box::new(move || {
            let out = catch_unwind(AssertUnwindSafe(job));
            let _ = tx.send(out);
        });
        self.jobs
            .send(wrapped)
            .map_err(|_| WorkerError::Gone(self.index))?;
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                warn!(worker = self.index, "crypto job panicked");
                Err(WorkerError::Panicked(self.index))
            }
            Err(_) => Err(WorkerError::Gone(self.index)),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Ok(mut idle) = self.pool.idle.lock() {
            idle.push_back(self.index);
        }
    }
}
