//! Timer job dispatch.
//!
//! Receives due jobs from the timer driver. Seal checks run inline (they
//! only touch in-memory state); deliveries and sealed batches are spawned
//! so one slow destination cannot hold up the timers of other configs.

use crate::media_group::{GroupKey, MediaGroupAggregator, SealOutcome};
use crate::metrics;
use crate::queue::Payload;
use crate::scheduler::DeliveryScheduler;
use crate::stats::{Counter, StatsRegistry};
use crate::store::{Action, ActionLogEntry, Store};
use crate::timer::{TimerJob, TimerQueue};
use crate::transport::Transport;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

pub(super) struct Dispatcher<T: Transport, S: Store> {
    pub scheduler: Arc<DeliveryScheduler<T, S>>,
    pub aggregator: Arc<MediaGroupAggregator>,
    pub timers: Arc<TimerQueue>,
    pub stats: Arc<StatsRegistry>,
}

impl<T: Transport, S: Store> Dispatcher<T, S> {
    pub async fn run(
        self,
        mut jobs: mpsc::UnboundedReceiver<TimerJob>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Dispatcher started");
        loop {
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(job) => self.dispatch(job).await,
                    None => break,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Dispatcher stopped");
    }

    async fn dispatch(&self, job: TimerJob) {
        match job {
            TimerJob::SealGroup(key) => self.seal(key).await,
            TimerJob::Deliver(task) => {
                let scheduler = Arc::clone(&self.scheduler);
                tokio::spawn(async move { scheduler.run_delayed(task).await });
            }
        }
    }

    async fn seal(&self, key: GroupKey) {
        match self.aggregator.try_seal(&key, Instant::now()) {
            SealOutcome::Pending(deadline) => {
                self.timers.schedule(deadline, TimerJob::SealGroup(key));
            }
            SealOutcome::Sealed(Ok(batch)) => {
                debug!(group = %key, items = batch.len(), "Scheduling sealed media group");
                let scheduler = Arc::clone(&self.scheduler);
                let config = Arc::clone(&batch.config);
                tokio::spawn(async move {
                    let outcome = scheduler.schedule(config, Payload::Batch(batch)).await;
                    debug!(outcome = ?outcome, "Media group scheduled");
                });
            }
            SealOutcome::Sealed(Err(e)) => {
                error!(group = %key, error = %e, "Media group dropped");
                self.stats.incr(key.config_id, Counter::GroupDropped);
                metrics::record_group_dropped(key.config_id, e.kind());
                self.scheduler
                    .audit(
                        ActionLogEntry::new(key.config_id, Action::GroupDropped, false).with_context(json!({
                            "group_id": key.group_id,
                            "error": e.to_string(),
                        })),
                    )
                    .await;
            }
            SealOutcome::Missing => {
                debug!(group = %key, "Seal check for a group no longer buffered");
            }
        }
        metrics::set_pending_timers(self.timers.len());
    }
}
