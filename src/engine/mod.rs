// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The orchestrator that ties together:
//! - Duplicate suppression via [`crate::dedup::DedupFilter`]
//! - Config resolution via [`crate::store::ConfigCache`]
//! - Album buffering via [`crate::media_group::MediaGroupAggregator`]
//! - Delivery via [`crate::scheduler::DeliveryScheduler`]
//! - Edit replay via [`crate::edit_sync::EditSynchronizer`]
//!
//! # Event Flow
//!
//! ```text
//! InboundEvent ─► normalize ─► dedup ─► resolve configs ─► filter
//!                                                           │
//!                  ┌────────────────────┬───────────────────┤
//!                  ▼                    ▼                   ▼
//!            edit: sync_edit   album member: ingest   single: schedule
//!                                       │
//!                              seal timer (TimerQueue)
//!                                       │
//!                                       ▼
//!                              sealed batch: schedule
//! ```
//!
//! One background driver owns every timer (seal checks and delayed
//! deliveries), so shutdown cancels all of them in one sweep.

mod dispatch;
mod types;

pub use types::{EngineState, HealthCheck, Outcome};

use crate::circuit_breaker::DestinationCircuits;
use crate::config::{ConfigId, EngineConfig, ReplicationConfig};
use crate::dedup::DedupFilter;
use crate::edit_sync::{EditOutcome, EditSynchronizer};
use crate::error::{ReplicationError, Result};
use crate::event::{InboundEvent, InboundUnit};
use crate::filter::{AllowAll, ContentFilter};
use crate::media_group::{Ingested, MediaGroupAggregator};
use crate::metrics;
use crate::queue::Payload;
use crate::replicator::Replicator;
use crate::resilience::{ChannelRateLimiter, RateLimiterSnapshot, TransportThrottle};
use crate::scheduler::{DeliveryScheduler, SchedulerSettings};
use crate::stats::{Counter, EngineStats, StatsRegistry};
use crate::store::{ConfigCache, InMemoryStore, Store};
use crate::timer::{TimerJob, TimerQueue};
use crate::transport::{NoOpTransport, Transport};
use dispatch::Dispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long shutdown waits for each background task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const MIN_MAINTENANCE_PERIOD: Duration = Duration::from_millis(100);

/// The main replication engine.
///
/// Accepts platform events through [`handle_event`](Self::handle_event)
/// and replicates them to the destinations of every active config for the
/// event's source chat.
///
/// Storage (configs, mappings, audit log) and the platform API are both
/// injected. Nothing here is process-global: two engines in one process
/// share no state.
pub struct ReplicationEngine<T: Transport = NoOpTransport, S: Store = InMemoryStore> {
    config: EngineConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    store: Arc<S>,
    configs: ConfigCache<S>,
    filter: Arc<dyn ContentFilter>,

    dedup: Arc<DedupFilter>,
    aggregator: Arc<MediaGroupAggregator>,
    timers: Arc<TimerQueue>,
    replicator: Arc<Replicator<T, S>>,
    scheduler: Arc<DeliveryScheduler<T, S>>,
    edits: EditSynchronizer<T, S>,
    stats: Arc<StatsRegistry>,

    /// Background task handles
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl ReplicationEngine<NoOpTransport, InMemoryStore> {
    /// Engine with a no-op transport and an in-memory store.
    pub fn standalone(config: EngineConfig, store: Arc<InMemoryStore>) -> Self {
        Self::new(config, Arc::new(NoOpTransport::new()), store)
    }
}

impl<T: Transport, S: Store> ReplicationEngine<T, S> {
    /// Create a new engine in `Created` state.
    ///
    /// Call [`start()`](Self::start) before feeding events.
    pub fn new(config: EngineConfig, transport: Arc<T>, store: Arc<S>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = &config.settings;

        let throttle = TransportThrottle::from_config(&settings.throttle);
        if let Some(t) = &throttle {
            info!(per_second = t.config().per_second, burst = t.config().burst, "Global transport throttle enabled");
        }
        let replicator = Arc::new(
            Replicator::new(transport, Arc::clone(&store))
                .with_throttle(throttle)
                .with_circuits(DestinationCircuits::from_settings(&settings.circuit)),
        );

        let timers = Arc::new(TimerQueue::new());
        let stats = Arc::new(StatsRegistry::new());
        let scheduler = Arc::new(DeliveryScheduler::new(
            Arc::clone(&replicator),
            Arc::clone(&store),
            Arc::new(ChannelRateLimiter::new()),
            Arc::clone(&timers),
            Arc::clone(&stats),
            SchedulerSettings {
                retry: settings.queue.retry_policy(),
                batch_retry: settings.queue.batch_retry_policy(),
                inter_task_pause: settings.queue.inter_task_pause_duration(),
            },
            shutdown_rx.clone(),
        ));

        Self {
            configs: ConfigCache::new(Arc::clone(&store), settings.config_cache.ttl_duration()),
            filter: Arc::new(AllowAll),
            dedup: Arc::new(DedupFilter::new()),
            aggregator: Arc::new(MediaGroupAggregator::new(
                settings.media_group.quiet_period_duration(),
                settings.media_group.sealed_retention_duration(),
            )),
            edits: EditSynchronizer::new(Arc::clone(&replicator), Arc::clone(&store)),
            timers,
            replicator,
            scheduler,
            stats,
            store,
            config,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Install the content filter consulted for configs with
    /// `content_filter` set.
    #[must_use]
    pub fn with_filter(mut self, filter: impl ContentFilter) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<T> {
        self.replicator.transport()
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Start the background tasks.
    ///
    /// 1. Timer driver (seal checks, delayed deliveries, retries)
    /// 2. Dispatcher consuming due timer jobs
    /// 3. Periodic maintenance (dedup clearing, sealed-group pruning)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(instance_id = %self.config.instance_id, "Starting replication engine");

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let mut handles = self.handles.write().await;

        let timers = Arc::clone(&self.timers);
        let shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move { timers.run(job_tx, shutdown_rx).await }));

        let dispatcher = Dispatcher {
            scheduler: Arc::clone(&self.scheduler),
            aggregator: Arc::clone(&self.aggregator),
            timers: Arc::clone(&self.timers),
            stats: Arc::clone(&self.stats),
        };
        let shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move { dispatcher.run(job_rx, shutdown_rx).await }));

        handles.push(self.spawn_maintenance_task());
        drop(handles);

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!(instance_id = %self.config.instance_id, "Replication engine running");

        Ok(())
    }

    /// Clear the dedup set and forget old sealed group ids on their
    /// respective intervals.
    fn spawn_maintenance_task(&self) -> JoinHandle<()> {
        let dedup = Arc::clone(&self.dedup);
        let aggregator = Arc::clone(&self.aggregator);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let clear_every = self
            .config
            .settings
            .dedup
            .clear_interval_duration()
            .max(MIN_MAINTENANCE_PERIOD);
        let prune_every = self
            .config
            .settings
            .media_group
            .sealed_retention_duration()
            .max(MIN_MAINTENANCE_PERIOD);

        tokio::spawn(async move {
            let start = Instant::now();
            let mut clear_timer = tokio::time::interval_at(start + clear_every, clear_every);
            let mut prune_timer = tokio::time::interval_at(start + prune_every, prune_every);

            loop {
                tokio::select! {
                    _ = clear_timer.tick() => {
                        let cleared = dedup.clear();
                        debug!(cleared, "Dedup set cleared");
                    }
                    _ = prune_timer.tick() => {
                        let pruned = aggregator.prune_sealed(Instant::now());
                        if pruned > 0 {
                            debug!(pruned, "Pruned sealed media group ids");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Maintenance task stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Feed one platform event through the pipeline.
    ///
    /// Returns one [`Outcome`] per active config of the source chat, or a
    /// single `DedupSkip`/`Ignored`. Skips are outcomes, not errors; an
    /// `Err` means the event could not be processed at all (engine not
    /// running, config store unavailable).
    pub async fn handle_event(&self, event: InboundEvent) -> Result<Vec<Outcome>> {
        if !self.is_running() {
            return Err(ReplicationError::InvalidState {
                expected: "Running".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        let unit = InboundUnit::from_event(&event);
        self.stats.event_received();
        metrics::record_event_received(event.kind.as_str());

        if !self.dedup.should_process(&unit) {
            info!(chat_id = unit.source_chat_id, message_id = unit.message_id, "Duplicate event, skipping");
            self.stats.dedup_skipped();
            metrics::record_dedup_skip();
            return Ok(vec![Outcome::DedupSkip]);
        }

        let configs = self.configs.resolve(unit.source_chat_id).await?;
        if configs.is_empty() {
            debug!(chat_id = unit.source_chat_id, "No active config for source, ignoring");
            self.stats.ignored();
            metrics::record_ignored_event();
            return Ok(vec![Outcome::Ignored]);
        }

        let mut outcomes = Vec::with_capacity(configs.len());
        for config in configs.iter() {
            let outcome = self.route(Arc::new(config.clone()), &unit).await;
            debug!(config_id = config.id, message_id = unit.message_id, outcome = ?outcome, "Event routed");
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn route(&self, config: Arc<ReplicationConfig>, unit: &InboundUnit) -> Outcome {
        let config_id = config.id;

        if config.content_filter && !self.filter.allows(&config, unit) {
            debug!(config_id, message_id = unit.message_id, "Rejected by content filter");
            self.stats.incr(config_id, Counter::Filtered);
            metrics::record_filtered(config_id);
            return Outcome::Filtered { config_id };
        }

        if unit.edited {
            return self.route_edit(&config, unit).await;
        }

        if unit.media_group_id.is_some() {
            return match self.aggregator.ingest(config, unit.clone()) {
                Ok(Ingested::Opened { key, deadline }) => {
                    self.timers.schedule(deadline, TimerJob::SealGroup(key.clone()));
                    metrics::set_pending_timers(self.timers.len());
                    Outcome::Buffered {
                        config_id,
                        group_id: key.group_id,
                    }
                }
                Ok(Ingested::Appended { key, .. }) => Outcome::Buffered {
                    config_id,
                    group_id: key.group_id,
                },
                Ok(Ingested::Stale { key }) => Outcome::StaleMember {
                    config_id,
                    group_id: key.group_id,
                },
                Err(e) => Outcome::Failed {
                    config_id,
                    error: e.to_string(),
                },
            };
        }

        self.scheduler
            .schedule(config, Payload::Single(unit.clone()))
            .await
    }

    async fn route_edit(&self, config: &ReplicationConfig, unit: &InboundUnit) -> Outcome {
        let config_id = config.id;
        match self.edits.sync_edit(config, unit).await {
            EditOutcome::Synced { destinations } => {
                self.stats.incr(config_id, Counter::EditSynced);
                Outcome::EditSynced {
                    config_id,
                    destinations,
                }
            }
            EditOutcome::Failed(e) => {
                self.stats.incr(config_id, Counter::EditFailed);
                Outcome::Failed {
                    config_id,
                    error: e.to_string(),
                }
            }
            skipped => Outcome::EditSkipped {
                config_id,
                reason: skipped.as_str(),
            },
        }
    }

    // =========================================================================
    // Admin surface
    // =========================================================================

    /// Pending sequential and delayed tasks of one config.
    pub fn queue_depth(&self, config_id: ConfigId) -> usize {
        self.scheduler.queue_depth(config_id)
    }

    /// Token bucket state. `None` until the config's first attempt.
    pub fn rate_limiter_state(&self, config_id: ConfigId) -> Option<RateLimiterSnapshot> {
        self.scheduler.limiter().snapshot(config_id)
    }

    /// Drop every pending sequential and delayed task of one config.
    /// In-flight attempts are not interrupted. Returns how many were dropped.
    pub fn flush_queue(&self, config_id: ConfigId) -> usize {
        self.scheduler.flush(config_id)
    }

    /// Call after a config was created, edited, toggled or deleted in the
    /// store so the next event sees the change.
    pub fn config_changed(&self, config: &ReplicationConfig) {
        self.configs.invalidate(config.source_channel_id);
        self.scheduler.limiter().reset(config.id);
        debug!(config_id = config.id, source = config.source_channel_id, "Config cache invalidated");
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    /// Health snapshot for monitoring endpoints. Performs no I/O.
    ///
    /// ```rust,ignore
    /// let health = engine.health_check();
    /// if health.ready { /* 200 */ } else { /* 503 */ }
    /// ```
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let circuits = self
            .replicator
            .circuits()
            .map(DestinationCircuits::snapshot)
            .unwrap_or_default();
        let ready = state == EngineState::Running;
        let healthy = ready && circuits.iter().all(|c| !c.likely_open);

        HealthCheck {
            state,
            ready,
            healthy,
            queued_tasks: self.scheduler.queues().total_depth(),
            active_workers: self.scheduler.queues().active_workers(),
            pending_timers: self.timers.len(),
            open_media_groups: self.aggregator.pending_groups(),
            circuits,
        }
    }

    /// Shut the engine down.
    ///
    /// 1. Cancel every timer (seal checks, delayed deliveries, retries)
    /// 2. Drop open media-group buffers and queued sequential tasks
    /// 3. Wait for background tasks and workers (in-flight calls finish)
    pub async fn shutdown(&mut self) {
        info!(instance_id = %self.config.instance_id, "Shutting down replication engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let timers = self.timers.cancel_all();
        let groups = self.aggregator.cancel_all();
        let queued = self.scheduler.queues().clear_all();
        if timers + groups + queued > 0 {
            warn!(timers, groups, queued, "Pending work dropped at shutdown");
        }
        metrics::set_pending_timers(0);

        let handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }
        self.scheduler.join_workers(DRAIN_TIMEOUT).await;

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!(instance_id = %self.config.instance_id, "Replication engine stopped");
    }
}
