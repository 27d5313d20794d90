//! Worker pools: three interchangeable execution disciplines behind a
//! common submit/capacity contract, modeled as a tagged enum dispatched on the
//! pool's configured type.
//!
//! Grounded on `original_source/mqtt_flow/core/executor_pools.py`
//! (`SequentialPool`, `SimpleThreadPool`, `ThreadPool`).

use shared::config::PoolType;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::error;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A worker pool. `submit` never blocks the caller waiting for the task to
/// finish; it either runs the task, hands it off, or (bounded pool at
/// capacity) queues it internally.
#[derive(Clone)]
pub enum Pool {
    Sequential,
    SimpleThread { max_workers: usize, in_flight: Arc<AtomicUsize> },
    Thread { semaphore: Arc<Semaphore>, queue_depth: Arc<AtomicUsize> },
}

impl Pool {
    pub fn new(pool_type: PoolType, max_workers: usize) -> Self {
        match pool_type {
            PoolType::Sequential => Pool::Sequential,
            PoolType::SimpleThread => {
                Pool::SimpleThread { max_workers, in_flight: Arc::new(AtomicUsize::new(0)) }
            }
            PoolType::Thread => Pool::Thread {
                semaphore: Arc::new(Semaphore::new(max_workers)),
                queue_depth: Arc::new(AtomicUsize::new(0)),
            },
        }
    }

    /// True when the pool has room for another submission right now.
    pub fn resource_available(&self) -> bool {
        match self {
            Pool::Sequential => true,
            Pool::SimpleThread { max_workers, in_flight } => {
                in_flight.load(Ordering::SeqCst) <= *max_workers
            }
            Pool::Thread { .. } => true,
        }
    }

    pub fn running_tasks_count(&self) -> usize {
        match self {
            Pool::Sequential => 0,
            Pool::SimpleThread { in_flight, .. } => in_flight.load(Ordering::SeqCst),
            Pool::Thread { queue_depth, .. } => queue_depth.load(Ordering::SeqCst),
        }
    }

    /// Submit a task for execution. Exceptions inside the task are caught and
    /// logged, never propagated to the caller. The `Sequential` variant runs
    /// the task inline and only returns once it finishes, so a sequential
    /// queue's consumer processes one task to completion before the next;
    /// the other variants hand the task off and return immediately.
    pub async fn submit(&self, task: BoxedTask) {
        match self {
            Pool::Sequential => {
                task.await;
            }
            Pool::SimpleThread { in_flight, .. } => {
                let in_flight = in_flight.clone();
                in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    task.await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Pool::Thread { semaphore, queue_depth } => {
                let semaphore = semaphore.clone();
                let queue_depth = queue_depth.clone();
                queue_depth.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let permit = semaphore.acquire_owned().await;
                    task.await;
                    queue_depth.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                });
            }
        }
    }
}

/// Wrap a fallible task body so panics/errors inside it are caught and logged
/// rather than torn down the executor, matching the "catch-log-continue" policy.
pub fn guarded<F>(label: String, fut: F) -> BoxedTask
where
    F: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    Box::pin(async move {
        if let Err(e) = fut.await {
            error!(task = %label, error = %e, "exception in task consumer");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn sequential_pool_always_has_resource_available() {
        let pool = Pool::new(PoolType::Sequential, 1);
        assert!(pool.resource_available());
        assert_eq!(pool.running_tasks_count(), 0);
    }

    #[tokio::test]
    async fn sequential_pool_runs_inline_and_in_order() {
        let pool = Pool::new(PoolType::Sequential, 1);
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            pool.submit(guarded(format!("t{i}"), async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                order.lock().await.push(i);
                Ok(())
            }))
            .await;
            // each submit only returns once its task has completed, so the
            // order is visible immediately with no extra synchronization
            assert_eq!(*order.lock().await.last().unwrap(), i);
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn simple_thread_pool_reports_saturation_under_load() {
        let pool = Pool::new(PoolType::SimpleThread, 2);
        let counter = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        for _ in 0..5 {
            if !pool.resource_available() {
                continue;
            }
            let counter = counter.clone();
            let max_seen = max_seen.clone();
            pool.submit(guarded("t".into(), async move {
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }))
            .await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn thread_pool_bounds_concurrency_via_semaphore() {
        let pool = Pool::new(PoolType::Thread, 1);
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            pool.submit(guarded(format!("t{i}"), async move {
                order.lock().await.push(i);
                Ok(())
            }))
            .await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(order.lock().await.len(), 3);
    }
}
