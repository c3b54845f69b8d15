//! # Pool
//!
//! A bounded worker pool shared by every fan-out in the harness: bulk user registration, bulk
//! document mutation, and changes feed trackers running next to a mutation workload.
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("a pooled task panicked or was cancelled: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

/// Limits how many tasks run at the same time. Cloning shares the same limit.
///
/// Tasks on the pool must finish on their own. A task that waits for other pool work, such as
/// a changes feed waiting for a document the pool has yet to write, would keep its worker
/// forever.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);

        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Number of tasks that could start right now without waiting.
    pub fn available_workers(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Spawn a Tokio task that starts running `task` once a worker is free.
    pub fn spawn<F, T>(&self, task: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = self.semaphore.clone();

        tokio::spawn(async move {
            // The semaphore is owned by the pool and never closed.
            let _permit = semaphore.acquire_owned().await;
            task.await
        })
    }

    /// Drive borrowed futures on the current task, at most `max_workers` at a time.
    /// Results are returned in the same order as `tasks`.
    pub async fn run_all<I, F, T>(&self, tasks: I) -> Vec<T>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = T>,
    {
        let semaphore = &self.semaphore;

        join_all(tasks.into_iter().map(|task| async move {
            let _permit = semaphore.acquire().await;
            task.await
        }))
        .await
    }

    /// Wait for tasks previously started with `spawn`, in order.
    pub async fn join_all<T>(handles: Vec<JoinHandle<T>>) -> Vec<Result<T, PoolError>> {
        join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.map_err(PoolError::from))
            .collect()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool::new(10)
    }
}
