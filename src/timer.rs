//! Single timer queue for media-group seals and delayed deliveries.
//!
//! All time-driven work goes through one deadline-ordered heap owned by
//! the engine. A driver task sleeps until the earliest deadline (or until
//! a new, earlier job is scheduled) and hands due jobs to the dispatcher
//! over a channel. Cancelling on shutdown is a single `cancel_all()`.

use crate::config::ConfigId;
use crate::media_group::GroupKey;
use crate::queue::QueueTask;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

/// Work fired by the timer.
#[derive(Debug, Clone)]
pub enum TimerJob {
    /// Check whether a media group's quiet period has elapsed.
    SealGroup(GroupKey),
    /// Deliver a delayed (or retrying) task.
    Deliver(QueueTask),
}

impl TimerJob {
    pub fn config_id(&self) -> ConfigId {
        match self {
            Self::SealGroup(key) => key.config_id,
            Self::Deliver(task) => task.config_id(),
        }
    }

    pub fn is_delivery(&self) -> bool {
        matches!(self, Self::Deliver(_))
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    job: TimerJob,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Ties fire in scheduling order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
pub struct TimerQueue {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    seq: AtomicU64,
    notify: Notify,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Reverse<Entry>>> {
        self.heap.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedule `job` at `deadline` and wake the driver.
    pub fn schedule(&self, deadline: Instant, job: TimerJob) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.lock().push(Reverse(Entry { deadline, seq, job }));
        self.notify.notify_one();
    }

    /// Remove and return every job due at `now`, earliest first.
    pub fn pop_due(&self, now: Instant) -> Vec<TimerJob> {
        let mut heap = self.lock();
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse(e)| e.deadline <= now) {
            if let Some(Reverse(entry)) = heap.pop() {
                due.push(entry.job);
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().peek().map(|Reverse(e)| e.deadline)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Pending delayed deliveries of one config.
    pub fn delayed_for(&self, config_id: ConfigId) -> usize {
        self.lock()
            .iter()
            .filter(|Reverse(e)| e.job.is_delivery() && e.job.config_id() == config_id)
            .count()
    }

    /// Drop every pending job. Returns how many.
    pub fn cancel_all(&self) -> usize {
        let mut heap = self.lock();
        let n = heap.len();
        heap.clear();
        n
    }

    /// Drop pending deliveries of one config. Seal checks stay.
    pub fn cancel_config(&self, config_id: ConfigId) -> usize {
        let mut heap = self.lock();
        let before = heap.len();
        heap.retain(|Reverse(e)| !(e.job.is_delivery() && e.job.config_id() == config_id));
        before - heap.len()
    }

    /// Drive the queue until shutdown, sending due jobs to `tx`.
    pub async fn run(&self, tx: mpsc::UnboundedSender<TimerJob>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Timer driver started");

        loop {
            for job in self.pop_due(Instant::now()) {
                if tx.send(job).is_err() {
                    debug!("Dispatcher gone, timer driver stopping");
                    return;
                }
            }

            let next = self.next_deadline();
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = self.notify.notified() => {}
                _ = sleep_until_opt(next) => {}
            }
        }

        info!("Timer driver stopped");
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
