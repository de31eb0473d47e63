//! Inbound event deduplication.
//!
//! Keys combine chat, message id, timestamp, and content fingerprint (see
//! [`InboundUnit::dedup_key`]). A reused message id with different content
//! yields a different key and passes through.
//!
//! The seen-set is cleared wholesale on an interval instead of expiring
//! per key; the platform stops redelivering well inside that window.

use crate::event::InboundUnit;
use dashmap::DashSet;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DedupFilter {
    seen: DashSet<String>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl DedupFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the unit the first time its key is seen.
    ///
    /// Add-if-absent is atomic, so two concurrent deliveries of the same
    /// event cannot both be accepted.
    pub fn should_process(&self, unit: &InboundUnit) -> bool {
        let fresh = self.seen.insert(unit.dedup_key());
        if fresh {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// Forget every key. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let n = self.seen.len();
        self.seen.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
