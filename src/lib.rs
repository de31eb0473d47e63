//! # Channel Replication
//!
//! Near-real-time replication of broadcast channel posts to one or more
//! destination channels and groups.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          channel-replication                              │
//! │                                                                           │
//! │  ┌──────────────┐    ┌─────────────┐    ┌──────────────────────────────┐  │
//! │  │ InboundEvent │───►│ DedupFilter │───►│ ConfigCache + ContentFilter  │  │
//! │  │ (normalize)  │    │ (seen keys) │    │ (per source chat)            │  │
//! │  └──────────────┘    └─────────────┘    └──────────────────────────────┘  │
//! │                                                │            │             │
//! │                        ┌───────────────────────┘            │ edits       │
//! │                        ▼                                    ▼             │
//! │  ┌──────────────────────────┐             ┌──────────────────────────┐    │
//! │  │ MediaGroupAggregator     │── sealed ──►│ DeliveryScheduler        │    │
//! │  │ (quiet-period buffers)   │             │ sequential│delayed│inline│    │
//! │  └──────────────────────────┘             └──────────────────────────┘    │
//! │             ▲                                        │                    │
//! │             └──── TimerQueue (seals, delays) ◄───────┤                    │
//! │                                                      ▼                    │
//! │  ┌──────────────────┐    ┌──────────────────────────────────────────┐     │
//! │  │ EditSynchronizer │───►│ Replicator (throttle, circuits, mapping) │     │
//! │  └──────────────────┘    └──────────────────────────────────────────┘     │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Disciplines
//!
//! 1. **Sequential**: strict FIFO per config, one worker drains the queue
//! 2. **Delayed**: fixed delay per unit, no ordering guarantee
//! 3. **Immediate**: inline, subject to the per-config rate limiter
//!
//! ## Usage
//!
//! ```rust,no_run
//! use channel_replication::{EngineConfig, InMemoryStore, ReplicationConfig, ReplicationEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(InMemoryStore::with_configs(vec![
//!         ReplicationConfig::new(1, -1001, -1002),
//!     ]));
//!     let mut engine = ReplicationEngine::standalone(EngineConfig::default(), store);
//!     engine.start().await.expect("Failed to start");
//!
//!     // Feed platform events with engine.handle_event(event).await
//!
//!     engine.shutdown().await;
//! }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod edit_sync;
pub mod engine;
pub mod error;
pub mod event;
pub mod filter;
pub mod media_group;
pub mod metrics;
pub mod queue;
pub mod replicator;
pub mod resilience;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod timer;
pub mod transport;
mod worker;

// Re-exports for convenience
pub use circuit_breaker::{CircuitSnapshot, DestinationBreaker, DestinationCircuits};
pub use config::{CircuitSettings, Discipline, EngineConfig, EngineSettings, ReplicationConfig};
pub use engine::{EngineState, HealthCheck, Outcome, ReplicationEngine};
pub use error::{ReplicationError, Result};
pub use event::{ChatId, Content, ContentKind, EventKind, InboundEvent, InboundUnit, MessageId, PlatformMessage};
pub use filter::{AllowAll, ContentFilter};
pub use resilience::{ChannelRateLimiter, RateLimiterSnapshot, RetryPolicy, ThrottleConfig};
pub use stats::{ConfigStats, EngineStats};
pub use store::{
    Action, ActionLog, ActionLogEntry, ConfigStore, InMemoryStore, MappingStore, MessageMapping, Store,
};
pub use transport::{BoxFuture, MediaItem, NoOpTransport, Transport, TransportError, TransportResult};
