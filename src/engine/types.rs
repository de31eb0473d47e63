//! Engine state and result types.
//!
//! # State Transitions
//!
//! ```text
//!            start()               shutdown()
//! Created ───────────→ Running ───────────────→ ShuttingDown
//!    │                                               │
//!    │ shutdown()                                    │ (timers cancelled,
//!    ↓                                               ↓  tasks joined)
//! Stopped ←──────────────────────────────────────────┘
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: After `ReplicationEngine::new()`. Events are rejected.
//! - **Running**: Background tasks are up; `handle_event()` accepts events.
//! - **ShuttingDown**: Timers cleared, workers stop before their next task.
//! - **Stopped**: Background tasks joined. Safe to drop.

use crate::circuit_breaker::CircuitSnapshot;
use crate::config::ConfigId;
use std::time::Duration;

/// State of the replication engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::ReplicationEngine::start) to begin replication.
    Created,

    /// Accepting and replicating events.
    Running,

    /// Shutting down. No new events, no further sequential tasks.
    ShuttingDown,

    /// Stopped.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What happened to one event under one config.
///
/// Skips are expected control flow, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Replicated inline to this many destinations.
    Delivered { config_id: ConfigId, destinations: usize },
    /// Appended to the config's sequential queue.
    Queued { config_id: ConfigId, depth: usize },
    /// Fixed-delay timer started.
    Scheduled { config_id: ConfigId, execute_in: Duration },
    /// Inline attempt failed; a retry is on the timer.
    Retrying {
        config_id: ConfigId,
        attempt: u32,
        retry_in: Duration,
    },
    /// Held by the media-group aggregator.
    Buffered { config_id: ConfigId, group_id: String },
    /// Member of a media group that was already sealed; dropped.
    StaleMember { config_id: ConfigId, group_id: String },
    /// Edit replayed onto this many destination messages.
    EditSynced { config_id: ConfigId, destinations: usize },
    /// Edit not replayed (disabled, unsupported, or nothing cloned).
    EditSkipped { config_id: ConfigId, reason: &'static str },
    /// Already seen.
    DedupSkip,
    /// Token bucket empty; dropped.
    RateLimitSkip { config_id: ConfigId },
    /// Rejected by the content filter.
    Filtered { config_id: ConfigId },
    /// No active config for the source.
    Ignored,
    /// Terminal failure.
    Failed { config_id: ConfigId, error: String },
}

impl Outcome {
    pub fn config_id(&self) -> Option<ConfigId> {
        match self {
            Self::Delivered { config_id, .. }
            | Self::Queued { config_id, .. }
            | Self::Scheduled { config_id, .. }
            | Self::Retrying { config_id, .. }
            | Self::Buffered { config_id, .. }
            | Self::StaleMember { config_id, .. }
            | Self::EditSynced { config_id, .. }
            | Self::EditSkipped { config_id, .. }
            | Self::RateLimitSkip { config_id }
            | Self::Filtered { config_id }
            | Self::Failed { config_id, .. } => Some(*config_id),
            Self::DedupSkip | Self::Ignored => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Health snapshot for monitoring endpoints. Collected from in-memory
/// state only.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and accepting events.
    pub ready: bool,
    /// Ready and no destination circuit looks open.
    pub healthy: bool,
    pub queued_tasks: usize,
    pub active_workers: usize,
    pub pending_timers: usize,
    pub open_media_groups: usize,
    pub circuits: Vec<CircuitSnapshot>,
}
