// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deferred work: queue tasks and per-config sequential queues.
//!
//! A [`QueueTask`] is an immutable value. A retry or a rate-limit deferral
//! produces a new task (`retried`, `deferred_to`) instead of mutating the
//! one in the queue, so the FIFO order of what is stored never changes
//! underneath a reader.
//!
//! # Sequential queue
//!
//! One [`ConfigQueue`] per config id, with a `draining` flag guarded by the
//! same mutex as the task list:
//!
//! ```text
//!          push_back (draining=false → true, caller spawns worker)
//!   Idle ──────────────────────────────────────────────→ Draining
//!    ↑                                                       │
//!    └──────────── release_if_empty (queue empty) ───────────┘
//! ```
//!
//! Because the flag flips under the same lock as the task list, a push
//! that races with a worker going idle either sees `draining=true` (and the
//! worker will find the task) or flips it itself and starts a new worker.

use crate::config::{ConfigId, ReplicationConfig};
use crate::event::{InboundUnit, MessageId};
use crate::media_group::MediaGroupBatch;
use crate::replicator::Delivery;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;

/// What a task delivers.
#[derive(Debug, Clone)]
pub enum Payload {
    Single(InboundUnit),
    Batch(MediaGroupBatch),
}

impl Payload {
    /// Source message id used in task ids and logs. For batches, the
    /// lowest member id.
    pub fn source_ref(&self) -> MessageId {
        match self {
            Self::Single(unit) => unit.message_id,
            Self::Batch(batch) => batch.first_message_id().unwrap_or_default(),
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Single(unit) => unit.kind().as_str(),
            Self::Batch(_) => "media_group",
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }
}

/// Discipline tag carried by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDiscipline {
    Sequential,
    Delayed,
}

impl TaskDiscipline {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Delayed => "delayed",
        }
    }
}

/// A unit of deferred delivery.
#[derive(Debug, Clone)]
pub struct QueueTask {
    /// `config:source:created-nanos`.
    pub id: String,
    pub config: Arc<ReplicationConfig>,
    pub payload: Arc<Payload>,
    /// Not eligible before this instant.
    pub execute_at: Instant,
    /// Failed attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub discipline: TaskDiscipline,
    /// Destinations already reached by an earlier partial attempt.
    pub delivered: Vec<Delivery>,
    /// Flush generation of the config when the task was created. A task
    /// older than the config's current generation has been flushed.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

impl QueueTask {
    pub fn new(
        config: Arc<ReplicationConfig>,
        payload: Payload,
        discipline: TaskDiscipline,
        execute_at: Instant,
        max_attempts: u32,
    ) -> Self {
        let created_at = Utc::now();
        let id = format!(
            "{}:{}:{}",
            config.id,
            payload.source_ref(),
            created_at.timestamp_nanos_opt().unwrap_or_default()
        );
        Self {
            id,
            config,
            payload: Arc::new(payload),
            execute_at,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            discipline,
            delivered: Vec::new(),
            generation: 0,
            created_at,
        }
    }

    #[must_use]
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn config_id(&self) -> ConfigId {
        self.config.id
    }

    /// Copy after one more failed attempt, eligible again at `execute_at`.
    #[must_use]
    pub fn retried(&self, execute_at: Instant, delivered: Vec<Delivery>) -> Self {
        Self {
            attempts: self.attempts + 1,
            execute_at,
            delivered,
            ..self.clone()
        }
    }

    /// Copy postponed without consuming an attempt.
    #[must_use]
    pub fn deferred_to(&self, execute_at: Instant) -> Self {
        Self {
            execute_at,
            ..self.clone()
        }
    }

    /// No further attempt allowed.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<QueueTask>,
    draining: bool,
}

/// FIFO queue of one config plus its worker flag.
#[derive(Default)]
pub struct ConfigQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

impl ConfigQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a task. Returns the new depth and whether the caller must
    /// start a worker (the queue was idle).
    pub fn push_back(&self, task: QueueTask) -> (usize, bool) {
        let mut state = self.lock();
        state.tasks.push_back(task);
        let start = !state.draining;
        state.draining = true;
        (state.tasks.len(), start)
    }

    /// Put a task back at the head (retry or deferral of the head task).
    pub fn push_front(&self, task: QueueTask) {
        self.lock().tasks.push_front(task);
    }

    pub fn peek_execute_at(&self) -> Option<Instant> {
        self.lock().tasks.front().map(|t| t.execute_at)
    }

    pub fn pop_front(&self) -> Option<QueueTask> {
        self.lock().tasks.pop_front()
    }

    /// Go idle if nothing is queued. Returns `true` when the worker should
    /// exit.
    pub fn release_if_empty(&self) -> bool {
        let mut state = self.lock();
        if state.tasks.is_empty() {
            state.draining = false;
            true
        } else {
            false
        }
    }

    /// Unconditionally mark idle (worker stopping on shutdown).
    pub fn release(&self) {
        self.lock().draining = false;
    }

    pub fn depth(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    /// Drop all pending tasks and wake a sleeping worker.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut state = self.lock();
            let n = state.tasks.len();
            state.tasks.clear();
            n
        };
        self.wake.notify_one();
        dropped
    }

    /// Wait for a flush.
    pub async fn woken(&self) {
        self.wake.notified().await;
    }
}

/// Sequential queues keyed by config id.
#[derive(Default)]
pub struct SequentialQueues {
    queues: DashMap<ConfigId, Arc<ConfigQueue>>,
}

impl SequentialQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for `config_id`, created on first use.
    pub fn queue(&self, config_id: ConfigId) -> Arc<ConfigQueue> {
        self.queues.entry(config_id).or_default().clone()
    }

    pub fn depth(&self, config_id: ConfigId) -> usize {
        self.queues.get(&config_id).map(|q| q.depth()).unwrap_or(0)
    }

    pub fn total_depth(&self) -> usize {
        self.queues.iter().map(|q| q.depth()).sum()
    }

    pub fn flush(&self, config_id: ConfigId) -> usize {
        self.queues.get(&config_id).map(|q| q.clear()).unwrap_or(0)
    }

    pub fn clear_all(&self) -> usize {
        self.queues.iter().map(|q| q.clear()).sum()
    }

    pub fn active_workers(&self) -> usize {
        self.queues.iter().filter(|q| q.is_draining()).count()
    }
}
