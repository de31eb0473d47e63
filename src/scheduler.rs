// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delivery scheduling.
//!
//! Routes a ready unit (single message or sealed batch) by the config's
//! discipline:
//!
//! 1. **Sequential**: append to the config's queue; start its worker if idle
//! 2. **Delayed**: put an independent timer job on the [`TimerQueue`]
//! 3. **Immediate**: attempt inline
//!
//! Every attempt passes the per-config rate limiter first. What happens to
//! a denied attempt depends on the discipline:
//!
//! | Discipline | Rate limited | Retryable failure |
//! |------------|--------------|-------------------|
//! | Immediate | dropped (`RateLimitSkip`) | continues on the timer with backoff |
//! | Delayed | timer moved to the next refill | timer moved by backoff |
//! | Sequential | head waits for the next refill | head waits by backoff |
//!
//! A rate-limit deferral does not consume an attempt. Terminal failures
//! are reported exactly once per task.

use crate::config::{ConfigId, Discipline, ReplicationConfig};
use crate::engine::Outcome;
use crate::error::ReplicationError;
use crate::metrics;
use crate::queue::{ConfigQueue, Payload, QueueTask, SequentialQueues, TaskDiscipline};
use crate::replicator::{Delivery, Replicated, ReplicationFailure, Replicator};
use crate::resilience::{ChannelRateLimiter, RetryPolicy};
use crate::stats::{Counter, StatsRegistry};
use crate::store::{record_action, Action, ActionLogEntry, Store};
use crate::timer::{TimerJob, TimerQueue};
use crate::transport::Transport;
use crate::worker;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Retry and pacing knobs.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub retry: RetryPolicy,
    pub batch_retry: RetryPolicy,
    pub inter_task_pause: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            batch_retry: RetryPolicy::batch(),
            inter_task_pause: Duration::from_secs(1),
        }
    }
}

/// Result of one gated attempt.
pub(crate) enum Attempt {
    Delivered(Replicated),
    RateLimited,
    Failed(ReplicationFailure),
}

pub struct DeliveryScheduler<T: Transport, S: Store> {
    replicator: Arc<Replicator<T, S>>,
    store: Arc<S>,
    limiter: Arc<ChannelRateLimiter>,
    timers: Arc<TimerQueue>,
    queues: SequentialQueues,
    stats: Arc<StatsRegistry>,
    settings: SchedulerSettings,
    workers: DashMap<ConfigId, JoinHandle<()>>,
    /// Bumped by every flush of a config.
    generations: DashMap<ConfigId, u64>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T: Transport, S: Store> DeliveryScheduler<T, S> {
    pub fn new(
        replicator: Arc<Replicator<T, S>>,
        store: Arc<S>,
        limiter: Arc<ChannelRateLimiter>,
        timers: Arc<TimerQueue>,
        stats: Arc<StatsRegistry>,
        settings: SchedulerSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            replicator,
            store,
            limiter,
            timers,
            queues: SequentialQueues::new(),
            stats,
            settings,
            workers: DashMap::new(),
            generations: DashMap::new(),
            shutdown_rx,
        }
    }

    pub fn queues(&self) -> &SequentialQueues {
        &self.queues
    }

    pub fn limiter(&self) -> &Arc<ChannelRateLimiter> {
        &self.limiter
    }

    pub(crate) fn inter_task_pause(&self) -> Duration {
        self.settings.inter_task_pause
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn generation(&self, config_id: ConfigId) -> u64 {
        self.generations.get(&config_id).map(|g| *g).unwrap_or(0)
    }

    /// True when the task's config was flushed after the task was created.
    fn is_flushed(&self, task: &QueueTask) -> bool {
        task.generation < self.generation(task.config_id())
    }

    /// Drop `task` if a flush overtook it. Returns whether it was dropped.
    pub(crate) fn discard_if_flushed(&self, task: &QueueTask, stage: &'static str) -> bool {
        if !self.is_flushed(task) {
            return false;
        }
        debug!(
            config_id = task.config_id(),
            task_id = %task.id,
            attempts = task.attempts,
            stage,
            "Task flushed while in flight, dropped"
        );
        true
    }

    fn policy_for(&self, payload: &Payload) -> &RetryPolicy {
        if payload.is_batch() {
            &self.settings.batch_retry
        } else {
            &self.settings.retry
        }
    }

    /// Route `payload` by the config's discipline.
    pub async fn schedule(self: &Arc<Self>, config: Arc<ReplicationConfig>, payload: Payload) -> Outcome {
        match config.discipline() {
            Discipline::Sequential => self.enqueue(config, payload).await,
            Discipline::Delayed(delay) => self.delay(config, payload, delay).await,
            Discipline::Immediate => self.execute_now(config, payload).await,
        }
    }

    async fn enqueue(self: &Arc<Self>, config: Arc<ReplicationConfig>, payload: Payload) -> Outcome {
        let config_id = config.id;
        let max_attempts = self.policy_for(&payload).max_attempts;
        let task = QueueTask::new(config, payload, TaskDiscipline::Sequential, Instant::now(), max_attempts)
            .with_generation(self.generation(config_id));
        let source = task.payload.source_ref();

        let queue = self.queues.queue(config_id);
        let (depth, start_worker) = queue.push_back(task);
        metrics::set_queue_depth(config_id, depth);
        self.stats.incr(config_id, Counter::Queued);
        debug!(config_id, source_message_id = source, depth, "Task queued");

        self.audit(
            ActionLogEntry::new(config_id, Action::Queued, true)
                .with_context(json!({ "discipline": "sequential", "source_message_id": source, "depth": depth })),
        )
        .await;

        if start_worker {
            self.spawn_worker(config_id, queue);
        }
        Outcome::Queued { config_id, depth }
    }

    async fn delay(&self, config: Arc<ReplicationConfig>, payload: Payload, delay: Duration) -> Outcome {
        let config_id = config.id;
        let max_attempts = self.policy_for(&payload).max_attempts;
        let execute_at = Instant::now() + delay;
        let task = QueueTask::new(config, payload, TaskDiscipline::Delayed, execute_at, max_attempts)
            .with_generation(self.generation(config_id));
        let source = task.payload.source_ref();

        self.timers.schedule(execute_at, TimerJob::Deliver(task));
        metrics::set_pending_timers(self.timers.len());
        self.stats.incr(config_id, Counter::Queued);
        debug!(config_id, source_message_id = source, delay_ms = delay.as_millis() as u64, "Delivery delayed");

        self.audit(
            ActionLogEntry::new(config_id, Action::Queued, true).with_context(json!({
                "discipline": "delayed",
                "source_message_id": source,
                "delay_seconds": delay.as_secs(),
            })),
        )
        .await;

        Outcome::Scheduled {
            config_id,
            execute_in: delay,
        }
    }

    async fn execute_now(&self, config: Arc<ReplicationConfig>, payload: Payload) -> Outcome {
        let config_id = config.id;
        let generation = self.generation(config_id);
        match self.attempt(&config, &payload, &[]).await {
            Attempt::RateLimited => {
                self.on_rate_limited(config_id, &payload, "dropped").await;
                Outcome::RateLimitSkip { config_id }
            }
            Attempt::Delivered(replicated) => {
                let destinations = replicated.deliveries.len();
                self.on_delivered(&config, &payload, 1, &replicated).await;
                Outcome::Delivered {
                    config_id,
                    destinations,
                }
            }
            Attempt::Failed(failure) => {
                let error = failure.error.to_string();
                let max_attempts = self.policy_for(&payload).max_attempts;
                let task = QueueTask::new(config, payload, TaskDiscipline::Delayed, Instant::now(), max_attempts)
                    .with_generation(generation);
                match self.after_failure(&task, failure).await {
                    Some(retry) => {
                        let retry_in = retry.execute_at.saturating_duration_since(Instant::now());
                        let attempt = retry.attempts;
                        self.timers.schedule(retry.execute_at, TimerJob::Deliver(retry));
                        metrics::set_pending_timers(self.timers.len());
                        Outcome::Retrying {
                            config_id,
                            attempt,
                            retry_in,
                        }
                    }
                    None => Outcome::Failed { config_id, error },
                }
            }
        }
    }

    /// Deliver a task fired by the timer.
    pub async fn run_delayed(&self, task: QueueTask) {
        if self.is_shutting_down() {
            debug!(task_id = %task.id, "Shutting down, delayed task dropped");
            return;
        }
        if self.discard_if_flushed(&task, "fired") {
            return;
        }

        match self.attempt(&task.config, &task.payload, &task.delivered).await {
            Attempt::RateLimited => {
                let at = Instant::now() + self.limiter.time_until_refill(task.config_id());
                self.on_rate_limited(task.config_id(), &task.payload, "deferred").await;
                if !self.discard_if_flushed(&task, "rate_limited") {
                    self.timers.schedule(at, TimerJob::Deliver(task.deferred_to(at)));
                }
            }
            Attempt::Delivered(replicated) => {
                self.on_delivered(&task.config, &task.payload, task.attempts + 1, &replicated)
                    .await;
            }
            Attempt::Failed(failure) => {
                if let Some(retry) = self.after_failure(&task, failure).await {
                    self.timers.schedule(retry.execute_at, TimerJob::Deliver(retry));
                }
            }
        }
        metrics::set_pending_timers(self.timers.len());
    }

    /// Rate-limit gate, then replicate.
    pub(crate) async fn attempt(
        &self,
        config: &ReplicationConfig,
        payload: &Payload,
        delivered: &[Delivery],
    ) -> Attempt {
        if !self.limiter.try_acquire(config.id, config.rate_limit_per_minute) {
            return Attempt::RateLimited;
        }
        match self.replicator.replicate(config, payload, delivered).await {
            Ok(replicated) => Attempt::Delivered(replicated),
            Err(failure) => Attempt::Failed(failure),
        }
    }

    /// Record a failed attempt. Returns the retry task when another
    /// attempt is allowed, otherwise reports the terminal failure.
    /// A task whose config was flushed meanwhile is dropped without either.
    pub(crate) async fn after_failure(&self, task: &QueueTask, failure: ReplicationFailure) -> Option<QueueTask> {
        if self.discard_if_flushed(task, "failed") {
            return None;
        }
        let now = Instant::now();
        let failed = task.retried(now, failure.delivered);
        let error = failure.error;

        if !error.is_retryable() || failed.is_exhausted() {
            self.on_terminal_failure(&failed, &error).await;
            return None;
        }

        let delay = self.retry_delay(&failed, &error);
        let retry = failed.deferred_to(now + delay);
        let config_id = retry.config_id();

        warn!(
            config_id,
            task_id = %retry.id,
            attempt = retry.attempts,
            max_attempts = retry.max_attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Replication attempt failed, retrying"
        );
        self.stats.incr(config_id, Counter::Retried);
        metrics::record_retry(config_id, retry.attempts);
        self.audit(
            ActionLogEntry::new(config_id, Action::Retried, false).with_context(json!({
                "task_id": retry.id,
                "attempt": retry.attempts,
                "retry_in_ms": delay.as_millis() as u64,
                "error": error.to_string(),
                "discipline": retry.discipline.as_str(),
            })),
        )
        .await;

        Some(retry)
    }

    /// Backoff after the task's latest failure, stretched to any wait the
    /// platform asked for.
    fn retry_delay(&self, task: &QueueTask, error: &ReplicationError) -> Duration {
        let backoff = self
            .policy_for(&task.payload)
            .next_delay(task.attempts.saturating_sub(1));
        backoff.max(error.retry_after().unwrap_or_default())
    }

    async fn on_terminal_failure(&self, task: &QueueTask, error: &ReplicationError) {
        let config_id = task.config_id();
        error!(
            config_id,
            task_id = %task.id,
            attempts = task.attempts,
            kind = task.payload.kind_label(),
            error = %error,
            "Replication failed permanently"
        );
        self.stats.incr(config_id, Counter::Failed);
        metrics::record_clone_failure(config_id, error.kind());
        self.audit(
            ActionLogEntry::new(config_id, Action::CloneError, false).with_context(json!({
                "task_id": task.id,
                "source_message_id": task.payload.source_ref(),
                "kind": task.payload.kind_label(),
                "attempts": task.attempts,
                "retryable": error.is_retryable(),
                "error": error.to_string(),
                "delivered": task.delivered.iter().map(|d| d.chat_id).collect::<Vec<_>>(),
            })),
        )
        .await;
    }

    pub(crate) async fn on_delivered(
        &self,
        config: &ReplicationConfig,
        payload: &Payload,
        attempts: u32,
        replicated: &Replicated,
    ) {
        debug!(
            config_id = config.id,
            source_message_id = payload.source_ref(),
            destinations = replicated.deliveries.len(),
            attempts,
            "Replicated"
        );
        self.stats.incr(config.id, Counter::Cloned);
        metrics::record_clone_success(config.id, payload.kind_label());
        self.audit(
            ActionLogEntry::new(config.id, Action::CloneSuccess, true)
                .with_latency(replicated.latency)
                .with_context(json!({
                    "source_message_id": payload.source_ref(),
                    "kind": payload.kind_label(),
                    "attempts": attempts,
                    "destinations": replicated
                        .deliveries
                        .iter()
                        .map(|d| json!({ "chat_id": d.chat_id, "message_ids": d.message_ids }))
                        .collect::<Vec<_>>(),
                })),
        )
        .await;
    }

    pub(crate) async fn on_rate_limited(&self, config_id: ConfigId, payload: &Payload, disposition: &str) {
        info!(
            config_id,
            source_message_id = payload.source_ref(),
            disposition,
            "Rate limited"
        );
        self.stats.incr(config_id, Counter::RateLimited);
        metrics::record_rate_limited(config_id);
        self.audit(
            ActionLogEntry::new(config_id, Action::RateLimited, false).with_context(json!({
                "source_message_id": payload.source_ref(),
                "disposition": disposition,
            })),
        )
        .await;
    }

    pub(crate) async fn audit(&self, entry: ActionLogEntry) {
        record_action(self.store.as_ref(), entry).await;
    }

    fn spawn_worker(self: &Arc<Self>, config_id: ConfigId, queue: Arc<ConfigQueue>) {
        let scheduler = Arc::clone(self);
        let shutdown_rx = self.shutdown_rx.clone();
        let span = info_span!("sequential_worker", config_id);
        let handle = tokio::spawn(
            async move { worker::run_worker(scheduler, config_id, queue, shutdown_rx).await }
                .instrument(span),
        );
        if let Some(previous) = self.workers.insert(config_id, handle) {
            // The previous worker has already released the queue.
            drop(previous);
        }
    }

    /// Pending sequential tasks plus delayed deliveries of one config.
    pub fn queue_depth(&self, config_id: ConfigId) -> usize {
        self.queues.depth(config_id) + self.timers.delayed_for(config_id)
    }

    /// Drop every pending sequential and delayed task of one config.
    pub fn flush(&self, config_id: ConfigId) -> usize {
        *self.generations.entry(config_id).or_insert(0) += 1;
        let dropped = self.queues.flush(config_id) + self.timers.cancel_config(config_id);
        metrics::set_queue_depth(config_id, 0);
        metrics::record_queue_flush(config_id, dropped);
        info!(config_id, dropped, "Queue flushed");
        dropped
    }

    /// Await all worker tasks concurrently, each bounded by `timeout`.
    pub async fn join_workers(&self, timeout: Duration) {
        let ids: Vec<ConfigId> = self.workers.iter().map(|e| *e.key()).collect();
        let handles: Vec<_> = ids
            .into_iter()
            .filter_map(|id| self.workers.remove(&id))
            .collect();

        let results = join_all(
            handles
                .into_iter()
                .map(|(config_id, handle)| async move { (config_id, tokio::time::timeout(timeout, handle).await) }),
        )
        .await;

        for (config_id, result) in results {
            match result {
                Ok(Ok(())) => debug!(config_id, "Worker stopped"),
                Ok(Err(e)) => warn!(config_id, error = %e, "Worker panicked"),
                Err(_) => warn!(config_id, "Worker did not stop in time"),
            }
        }
    }
}
