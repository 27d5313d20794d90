//! Task Executor: one consumer loop per task queue.
//!
//! Grounded on `original_source/mqtt_flow/core/tasks_executor.py`: block on
//! the next queued task, check the bound pool has room, submit or drop, then
//! sleep long enough to respect the queue's rate limit before looping.

use crate::pool::{guarded, Pool};
use crate::task::Task;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Runs until the channel's sender side is dropped (orchestrator shutdown).
/// Sleeps between submissions so the queue never dispatches faster than
/// `execution_rate_limit_per_second` (every `tasks_queues` entry carries one,
/// defaulting to 1000/s).
pub async fn run_rate_limited_task_queue(
    queue_name: String,
    mut tasks: mpsc::Receiver<Box<dyn Task>>,
    pool: Pool,
    execution_rate_limit_per_second: u64,
) {
    let min_interval = if execution_rate_limit_per_second == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(1.0 / execution_rate_limit_per_second as f64)
    };

    while let Some(task) = tasks.recv().await {
        if pool.resource_available() {
            pool.submit(guarded(queue_name.clone(), task.process())).await;
        } else {
            warn!(queue = %queue_name, "pool saturated, dropping task");
        }

        if !min_interval.is_zero() {
            tokio::time::sleep(min_interval).await;
        }
    }
}
