//! Sequential queue worker.
//!
//! One worker per config with a non-empty queue. It takes the head task
//! only once its `execute_at` has passed, so a task waiting on backoff or a
//! rate-limit refill blocks everything behind it. A retried or deferred
//! task goes back to the head, unless the config was flushed while its
//! attempt was in flight. The worker exits when the queue drains and
//! [`ConfigQueue::push_back`] starts a fresh one on the next arrival.

use crate::config::ConfigId;
use crate::metrics;
use crate::queue::ConfigQueue;
use crate::scheduler::{Attempt, DeliveryScheduler};
use crate::store::Store;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

pub(crate) async fn run_worker<T: Transport, S: Store>(
    scheduler: Arc<DeliveryScheduler<T, S>>,
    config_id: ConfigId,
    queue: Arc<ConfigQueue>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!("Worker started");

    loop {
        if *shutdown_rx.borrow() {
            queue.release();
            debug!("Shutdown requested, worker stopping");
            return;
        }

        let Some(execute_at) = queue.peek_execute_at() else {
            if queue.release_if_empty() {
                debug!("Queue drained, worker exiting");
                return;
            }
            continue;
        };

        if execute_at > Instant::now() {
            tokio::select! {
                _ = tokio::time::sleep_until(execute_at) => {}
                _ = queue.woken() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        queue.release();
                        return;
                    }
                }
            }
            continue;
        }

        let Some(task) = queue.pop_front() else {
            continue;
        };
        metrics::set_queue_depth(config_id, queue.depth());

        match scheduler
            .attempt(&task.config, &task.payload, &task.delivered)
            .await
        {
            Attempt::RateLimited => {
                let at = Instant::now() + scheduler.limiter().time_until_refill(config_id);
                scheduler
                    .on_rate_limited(config_id, &task.payload, "deferred")
                    .await;
                if !scheduler.discard_if_flushed(&task, "rate_limited") {
                    queue.push_front(task.deferred_to(at));
                }
            }
            Attempt::Delivered(replicated) => {
                scheduler
                    .on_delivered(&task.config, &task.payload, task.attempts + 1, &replicated)
                    .await;
                if queue.depth() > 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(scheduler.inter_task_pause()) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
            Attempt::Failed(failure) => {
                if let Some(retry) = scheduler.after_failure(&task, failure).await {
                    queue.push_front(retry);
                }
            }
        }
    }
}
