//! Per-config counters for the admin surface.
//!
//! Metrics go to the `metrics` facade for scraping; these counters back
//! [`ReplicationEngine::stats()`](crate::ReplicationEngine::stats), which
//! operators query directly.

use crate::config::ConfigId;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct ConfigCounters {
    cloned: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    retried: AtomicU64,
    queued: AtomicU64,
    filtered: AtomicU64,
    edits_synced: AtomicU64,
    edits_failed: AtomicU64,
    groups_dropped: AtomicU64,
}

/// Counters of one config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigStats {
    pub cloned: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub retried: u64,
    pub queued: u64,
    pub filtered: u64,
    pub edits_synced: u64,
    pub edits_failed: u64,
    pub groups_dropped: u64,
}

/// Engine-wide statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub events_received: u64,
    pub dedup_skipped: u64,
    pub ignored: u64,
    pub configs: BTreeMap<ConfigId, ConfigStats>,
}

impl EngineStats {
    pub fn config(&self, config_id: ConfigId) -> ConfigStats {
        self.configs.get(&config_id).cloned().unwrap_or_default()
    }
}

/// Which per-config counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Cloned,
    Failed,
    RateLimited,
    Retried,
    Queued,
    Filtered,
    EditSynced,
    EditFailed,
    GroupDropped,
}

#[derive(Debug, Default)]
pub struct StatsRegistry {
    events_received: AtomicU64,
    dedup_skipped: AtomicU64,
    ignored: AtomicU64,
    configs: DashMap<ConfigId, ConfigCounters>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dedup_skipped(&self) {
        self.dedup_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr(&self, config_id: ConfigId, counter: Counter) {
        let entry = self.configs.entry(config_id).or_default();
        let c = entry.value();
        let target = match counter {
            Counter::Cloned => &c.cloned,
            Counter::Failed => &c.failed,
            Counter::RateLimited => &c.rate_limited,
            Counter::Retried => &c.retried,
            Counter::Queued => &c.queued,
            Counter::Filtered => &c.filtered,
            Counter::EditSynced => &c.edits_synced,
            Counter::EditFailed => &c.edits_failed,
            Counter::GroupDropped => &c.groups_dropped,
        };
        target.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStats {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        EngineStats {
            events_received: load(&self.events_received),
            dedup_skipped: load(&self.dedup_skipped),
            ignored: load(&self.ignored),
            configs: self
                .configs
                .iter()
                .map(|entry| {
                    let c = entry.value();
                    (
                        *entry.key(),
                        ConfigStats {
                            cloned: load(&c.cloned),
                            failed: load(&c.failed),
                            rate_limited: load(&c.rate_limited),
                            retried: load(&c.retried),
                            queued: load(&c.queued),
                            filtered: load(&c.filtered),
                            edits_synced: load(&c.edits_synced),
                            edits_failed: load(&c.edits_failed),
                            groups_dropped: load(&c.groups_dropped),
                        },
                    )
                })
                .collect(),
        }
    }
}
