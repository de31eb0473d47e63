// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication engine.
//!
//! Two layers of configuration exist:
//!
//! - [`EngineConfig`]: process-wide tuning (dedup window, media-group quiet
//!   period, queue pacing, retry policy, transport protection). Passed to
//!   [`ReplicationEngine::new()`](crate::ReplicationEngine::new) and
//!   deserializable from JSON.
//! - [`ReplicationConfig`]: one record per source channel, owned by the
//!   external config store and read through the
//!   [`ConfigCache`](crate::store::ConfigCache).
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── instance_id: String
//! └── settings: EngineSettings
//!     ├── dedup: DedupConfig             # periodic clear of seen keys
//!     ├── media_group: MediaGroupConfig  # quiet period before sealing
//!     ├── queue: QueueConfig             # pacing + retry policy
//!     ├── config_cache: ConfigCacheConfig
//!     ├── throttle: ThrottleConfig       # global transport ceiling
//!     └── circuit: CircuitSettings       # per-destination breaker
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "instance_id": "relay-1",
//!   "settings": {
//!     "media_group": { "quiet_period": "3s" },
//!     "queue": { "inter_task_pause": "1s", "max_attempts": 3 }
//!   }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use crate::event::ChatId;
use crate::resilience::{RetryPolicy, ThrottleConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Identifier of a replication config record.
pub type ConfigId = i64;

// ═══════════════════════════════════════════════════════════════════════════════
// EngineConfig: passed to ReplicationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Name of this engine instance (used in logs).
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    #[serde(default)]
    pub settings: EngineSettings,
}

fn default_instance_id() -> String {
    "channel-replication".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            settings: EngineSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Fast timings, no global throttle, no circuit breaker.
    pub fn for_testing(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            settings: EngineSettings::testing(),
        }
    }

    /// Parse from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ReplicationError::Config(format!("invalid engine config: {}", e)))
    }

    /// Load from a JSON file on disk.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }
}

/// Tunable settings for every pipeline component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub media_group: MediaGroupConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub config_cache: ConfigCacheConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub circuit: CircuitSettings,
}

impl EngineSettings {
    /// Millisecond-scale timings for tests.
    pub fn testing() -> Self {
        Self {
            dedup: DedupConfig {
                clear_interval: "1m".to_string(),
            },
            media_group: MediaGroupConfig {
                quiet_period: "100ms".to_string(),
                sealed_retention: "1m".to_string(),
            },
            queue: QueueConfig {
                inter_task_pause: "10ms".to_string(),
                max_attempts: 3,
                batch_max_attempts: 2,
                retry_base: "10ms".to_string(),
                retry_ceiling: "100ms".to_string(),
            },
            config_cache: ConfigCacheConfig {
                ttl: "50ms".to_string(),
            },
            throttle: ThrottleConfig {
                enabled: false,
                ..ThrottleConfig::default()
            },
            circuit: CircuitSettings {
                enabled: false,
                ..CircuitSettings::default()
            },
        }
    }
}

/// Parse a humantime duration, falling back to `default` on bad input.
fn parse_duration_or(raw: &str, default: Duration, field: &str) -> Duration {
    match humantime::parse_duration(raw) {
        Ok(d) => d,
        Err(e) => {
            warn!(field, value = %raw, error = %e, "Invalid duration, using default");
            default
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Component settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Dedup filter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// How often the set of seen event keys is cleared.
    /// The platform stops redelivering well before this.
    #[serde(default = "default_clear_interval")]
    pub clear_interval: String,
}

fn default_clear_interval() -> String {
    "5m".to_string()
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            clear_interval: default_clear_interval(),
        }
    }
}

impl DedupConfig {
    pub fn clear_interval_duration(&self) -> Duration {
        parse_duration_or(&self.clear_interval, Duration::from_secs(300), "dedup.clear_interval")
    }
}

/// Media-group aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaGroupConfig {
    /// Quiet period after the last member before a group is sealed.
    #[serde(default = "default_quiet_period")]
    pub quiet_period: String,

    /// How long sealed group ids are remembered to reject stale members.
    #[serde(default = "default_sealed_retention")]
    pub sealed_retention: String,
}

fn default_quiet_period() -> String {
    "3s".to_string()
}

fn default_sealed_retention() -> String {
    "10m".to_string()
}

impl Default for MediaGroupConfig {
    fn default() -> Self {
        Self {
            quiet_period: default_quiet_period(),
            sealed_retention: default_sealed_retention(),
        }
    }
}

impl MediaGroupConfig {
    pub fn quiet_period_duration(&self) -> Duration {
        parse_duration_or(&self.quiet_period, Duration::from_secs(3), "media_group.quiet_period")
    }

    pub fn sealed_retention_duration(&self) -> Duration {
        parse_duration_or(
            &self.sealed_retention,
            Duration::from_secs(600),
            "media_group.sealed_retention",
        )
    }
}

/// Sequential/delayed queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Pause between successful sequential tasks.
    #[serde(default = "default_inter_task_pause")]
    pub inter_task_pause: String,

    /// Attempts per single-message task before it is dropped.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Attempts per media-group task. Re-sending an album is costlier.
    #[serde(default = "default_batch_max_attempts")]
    pub batch_max_attempts: u32,

    /// Backoff base: delay = base * 2^attempt.
    #[serde(default = "default_retry_base")]
    pub retry_base: String,

    /// Backoff ceiling.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: String,
}

fn default_inter_task_pause() -> String {
    "1s".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_batch_max_attempts() -> u32 {
    2
}

fn default_retry_base() -> String {
    "2s".to_string()
}

fn default_retry_ceiling() -> String {
    "60s".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            inter_task_pause: default_inter_task_pause(),
            max_attempts: default_max_attempts(),
            batch_max_attempts: default_batch_max_attempts(),
            retry_base: default_retry_base(),
            retry_ceiling: default_retry_ceiling(),
        }
    }
}

impl QueueConfig {
    pub fn inter_task_pause_duration(&self) -> Duration {
        parse_duration_or(&self.inter_task_pause, Duration::from_secs(1), "queue.inter_task_pause")
    }

    fn base_and_ceiling(&self) -> (Duration, Duration) {
        (
            parse_duration_or(&self.retry_base, Duration::from_secs(2), "queue.retry_base"),
            parse_duration_or(&self.retry_ceiling, Duration::from_secs(60), "queue.retry_ceiling"),
        )
    }

    /// Retry policy for single-message tasks.
    pub fn retry_policy(&self) -> RetryPolicy {
        let (base, ceiling) = self.base_and_ceiling();
        RetryPolicy::new(self.max_attempts, base, ceiling)
    }

    /// Retry policy for media-group tasks.
    pub fn batch_retry_policy(&self) -> RetryPolicy {
        let (base, ceiling) = self.base_and_ceiling();
        RetryPolicy::new(self.batch_max_attempts, base, ceiling)
    }
}

/// Cache of per-source configs loaded from the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigCacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl: String,
}

fn default_cache_ttl() -> String {
    "30s".to_string()
}

impl Default for ConfigCacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
        }
    }
}

impl ConfigCacheConfig {
    pub fn ttl_duration(&self) -> Duration {
        parse_duration_or(&self.ttl, Duration::from_secs(30), "config_cache.ttl")
    }
}

/// Per-destination circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Failure rate (0.0 - 1.0) over the window that trips the circuit.
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f32,

    /// Number of calls observed while closed.
    #[serde(default = "default_window")]
    pub window: usize,

    /// Trial calls allowed while half-open.
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: usize,

    /// Seconds to stay open before probing.
    #[serde(default = "default_open_wait_sec")]
    pub open_wait_sec: u64,
}

fn default_true() -> bool {
    true
}

fn default_failure_rate() -> f32 {
    0.5
}

fn default_window() -> usize {
    10
}

fn default_half_open_probes() -> usize {
    2
}

fn default_open_wait_sec() -> u64 {
    30
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_rate: default_failure_rate(),
            window: default_window(),
            half_open_probes: default_half_open_probes(),
            open_wait_sec: default_open_wait_sec(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationConfig: one record per source channel (external store)
// ═══════════════════════════════════════════════════════════════════════════════

/// How a config's units are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Strict FIFO through the config's sequential queue.
    Sequential,
    /// Independent timer per unit, no ordering guarantee.
    Delayed(Duration),
    /// Inline, subject only to the rate limiter.
    Immediate,
}

/// Replication settings for one source channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub id: ConfigId,

    pub source_channel_id: ChatId,

    #[serde(default)]
    pub destination_channel_id: Option<ChatId>,

    /// Broadcast targets.
    #[serde(default)]
    pub destination_group_ids: Vec<ChatId>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Replay source edits to destinations.
    #[serde(default)]
    pub edit_sync: bool,

    /// Replication attempts per minute. Zero disables limiting.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    /// Fixed delay before delivery, in seconds.
    #[serde(default)]
    pub delay_seconds: u64,

    #[serde(default)]
    pub sequential: bool,

    /// Consult the content filter before replicating.
    #[serde(default)]
    pub content_filter: bool,

    /// Soft-delete marker.
    #[serde(default)]
    pub deleted: bool,
}

fn default_rate_limit_per_minute() -> u32 {
    30
}

impl ReplicationConfig {
    /// Minimal enabled config replicating `source` to `destination`.
    pub fn new(id: ConfigId, source: ChatId, destination: ChatId) -> Self {
        Self {
            id,
            source_channel_id: source,
            destination_channel_id: Some(destination),
            destination_group_ids: Vec::new(),
            enabled: true,
            edit_sync: false,
            rate_limit_per_minute: default_rate_limit_per_minute(),
            delay_seconds: 0,
            sequential: false,
            content_filter: false,
            deleted: false,
        }
    }

    /// Whether the config fans out to groups.
    pub fn is_broadcast(&self) -> bool {
        !self.destination_group_ids.is_empty()
    }

    /// Live means enabled and not soft-deleted.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.deleted
    }

    /// Destination channel first, then groups, without duplicates.
    pub fn destinations(&self) -> Vec<ChatId> {
        let mut seen = HashSet::new();
        self.destination_channel_id
            .into_iter()
            .chain(self.destination_group_ids.iter().copied())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Resolve the delivery discipline. Sequential wins over a delay.
    pub fn discipline(&self) -> Discipline {
        if self.sequential {
            Discipline::Sequential
        } else if self.delay_seconds > 0 {
            Discipline::Delayed(Duration::from_secs(self.delay_seconds))
        } else {
            Discipline::Immediate
        }
    }

    /// Check record-level invariants.
    pub fn validate(&self) -> Result<()> {
        if self.destinations().contains(&self.source_channel_id) {
            return Err(ReplicationError::Config(format!(
                "config {} replicates channel {} into itself",
                self.id, self.source_channel_id
            )));
        }
        if self.sequential && self.delay_seconds > 0 {
            warn!(
                config_id = self.id,
                delay_seconds = self.delay_seconds,
                "Both sequential and delayed delivery set; sequential takes precedence"
            );
        }
        Ok(())
    }
}

/// Check that no two active non-broadcast configs share a source.
pub fn validate_unique_sources(configs: &[ReplicationConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for config in configs.iter().filter(|c| !c.deleted && !c.is_broadcast()) {
        if !seen.insert(config.source_channel_id) {
            return Err(ReplicationError::Config(format!(
                "source {} has more than one non-broadcast config",
                config.source_channel_id
            )));
        }
    }
    Ok(())
}
