//! Per-destination circuit breakers.
//!
//! A destination that keeps failing (chat deleted, bot removed, platform
//! outage for that chat) should not absorb every retry of every queued
//! task. Each destination chat gets its own breaker. While it is open,
//! calls fail fast with [`ReplicationError::CircuitOpen`], which is
//! retryable, so sequential workers back off instead of hammering.
//!
//! Only [destination faults](ReplicationError::is_destination_fault) count
//! towards opening a breaker; an unsupported content kind says nothing
//! about the chat it was headed for.
//!
//! Uses the `recloser` crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Destination unhealthy, calls fail fast
//! - **HalfOpen**: A few probe calls decide whether to close again
//!
//! # Usage
//!
//! ```rust,no_run
//! # use channel_replication::circuit_breaker::DestinationCircuits;
//! # use channel_replication::config::CircuitSettings;
//! # use channel_replication::ReplicationError;
//! # async fn example() {
//! let circuits = DestinationCircuits::new(CircuitSettings::default());
//!
//! match circuits.guard(-1001, async { Ok::<i32, ReplicationError>(42) }).await {
//!     Ok(message_id) => { /* delivered */ }
//!     Err(ReplicationError::CircuitOpen { .. }) => { /* back off */ }
//!     Err(e) => { /* transport or content error */ }
//! }
//! # }
//! ```

use crate::config::CircuitSettings;
use crate::error::{ReplicationError, Result};
use crate::event::ChatId;
use crate::metrics;
use dashmap::DashMap;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Delivered,
    Failed,
    Rejected,
}

impl Verdict {
    fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "success",
            Self::Failed => "failure",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    delivered: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl Tally {
    fn note(&self, verdict: Verdict) {
        let counter = match verdict {
            Verdict::Delivered => &self.delivered,
            Verdict::Failed => &self.failed,
            Verdict::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn read(&self) -> (u64, u64, u64) {
        (
            self.delivered.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}

/// Breaker guarding one destination chat.
pub struct DestinationBreaker {
    destination: ChatId,
    recloser: AsyncRecloser,
    tally: Tally,
}

impl DestinationBreaker {
    pub fn new(destination: ChatId, settings: &CircuitSettings) -> Self {
        let recloser = Recloser::custom()
            .error_rate(settings.failure_rate.clamp(0.01, 1.0))
            .closed_len(settings.window.max(1))
            .half_open_len(settings.half_open_probes.max(1))
            .open_wait(Duration::from_secs(settings.open_wait_sec))
            .build();

        Self {
            destination,
            recloser: recloser.into(),
            tally: Tally::default(),
        }
    }

    pub fn destination(&self) -> ChatId {
        self.destination
    }

    /// Await `attempt` unless the breaker is open.
    pub async fn guard<Fut, T>(&self, attempt: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let outcome = self
            .recloser
            .call_with(|e: &ReplicationError| e.is_destination_fault(), attempt)
            .await;

        let (verdict, result) = match outcome {
            Ok(value) => (Verdict::Delivered, Ok(value)),
            Err(RecloserError::Rejected) => (
                Verdict::Rejected,
                Err(ReplicationError::CircuitOpen {
                    destination: self.destination,
                }),
            ),
            Err(RecloserError::Inner(e)) => (Verdict::Failed, Err(e)),
        };

        self.tally.note(verdict);
        metrics::record_circuit_call(self.destination, verdict.as_str());
        match verdict {
            Verdict::Rejected => warn!(destination = self.destination, "Destination circuit open, call rejected"),
            Verdict::Failed => debug!(destination = self.destination, "Guarded call failed"),
            Verdict::Delivered => {}
        }
        result
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let (delivered, failed, rejected) = self.tally.read();
        CircuitSnapshot {
            destination: self.destination,
            calls_total: delivered + failed + rejected,
            failures: failed,
            rejections: rejected,
            // Rough signal: recloser does not expose its state.
            likely_open: rejected > 0 && rejected > delivered,
        }
    }
}

/// Snapshot of one destination breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub destination: ChatId,
    pub calls_total: u64,
    pub failures: u64,
    pub rejections: u64,
    pub likely_open: bool,
}

/// Breakers keyed by destination chat, created on first use.
pub struct DestinationCircuits {
    settings: CircuitSettings,
    breakers: DashMap<ChatId, Arc<DestinationBreaker>>,
}

impl DestinationCircuits {
    pub fn new(settings: CircuitSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    /// `None` when circuit breaking is disabled.
    pub fn from_settings(settings: &CircuitSettings) -> Option<Self> {
        settings.enabled.then(|| Self::new(settings.clone()))
    }

    fn breaker(&self, destination: ChatId) -> Arc<DestinationBreaker> {
        self.breakers
            .entry(destination)
            .or_insert_with(|| Arc::new(DestinationBreaker::new(destination, &self.settings)))
            .clone()
    }

    /// Run `attempt` through the destination's breaker.
    pub async fn guard<Fut, T>(&self, destination: ChatId, attempt: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        // No shard lock across the await.
        let breaker = self.breaker(destination);
        breaker.guard(attempt).await
    }

    /// One entry per destination seen so far, sorted by chat id.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<_> = self.breakers.iter().map(|entry| entry.value().snapshot()).collect();
        out.sort_by_key(|s| s.destination);
        out
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| entry.value().snapshot().likely_open)
            .count()
    }
}
