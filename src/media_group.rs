// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Media-group aggregation.
//!
//! Albums arrive as separate messages sharing a group id. Members are
//! buffered per `(config, group)` until no new member has arrived for the
//! quiet period, then sealed into one [`MediaGroupBatch`].
//!
//! # Lifecycle
//!
//! ```text
//! ingest(first)  → Opened   (caller schedules a seal timer at the deadline)
//! ingest(next)   → Appended (deadline pushed back, no new timer)
//! try_seal(now)  → Pending(deadline) while members keep arriving
//!                → Sealed(batch) once, then the group id is remembered
//! ingest(late)   → Stale    (dropped)
//! ```
//!
//! Sealing is idempotent: the sealed-id set is written with an atomic
//! insert, and only the caller that performed the first insert gets the
//! batch. Overlapping timers for the same group never emit twice.

use crate::config::{ConfigId, ReplicationConfig};
use crate::error::{ReplicationError, Result};
use crate::event::{ChatId, Content, InboundUnit, MessageId};
use crate::metrics;
use crate::transport::MediaItem;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Buffers are scoped per config since one source may feed several configs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub config_id: ConfigId,
    pub group_id: String,
}

impl GroupKey {
    pub fn new(config_id: ConfigId, group_id: impl Into<String>) -> Self {
        Self {
            config_id,
            group_id: group_id.into(),
        }
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.config_id, self.group_id)
    }
}

/// A sealed, ordered album ready for delivery.
#[derive(Debug, Clone)]
pub struct MediaGroupBatch {
    pub config: Arc<ReplicationConfig>,
    pub group_id: String,
    pub source_chat_id: ChatId,
    /// All members, ascending by message id.
    pub members: Vec<InboundUnit>,
    /// Outbound items, ascending by source message id. The first carries
    /// the caption.
    pub items: Vec<MediaItem>,
    /// Source message id of each item, aligned with `items`.
    pub source_ids: Vec<MessageId>,
    pub caption: Option<String>,
}

impl MediaGroupBatch {
    pub fn first_message_id(&self) -> Option<MessageId> {
        self.source_ids.first().copied()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Result of [`MediaGroupAggregator::ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    /// First member; a seal check is due at `deadline`.
    Opened { key: GroupKey, deadline: Instant },
    /// Added to an open buffer.
    Appended { key: GroupKey, members: usize },
    /// Group already sealed; member dropped.
    Stale { key: GroupKey },
}

/// Result of [`MediaGroupAggregator::try_seal`].
#[derive(Debug)]
pub enum SealOutcome {
    /// Quiet period restarted; check again at the deadline.
    Pending(Instant),
    /// Sealed now. `Err` when no member maps to an album item.
    Sealed(Result<MediaGroupBatch>),
    /// Nothing buffered (already sealed or cancelled).
    Missing,
}

struct GroupBuffer {
    config: Arc<ReplicationConfig>,
    source_chat_id: ChatId,
    members: BTreeMap<MessageId, InboundUnit>,
    deadline: Instant,
}

pub struct MediaGroupAggregator {
    quiet_period: Duration,
    sealed_retention: Duration,
    buffers: DashMap<GroupKey, GroupBuffer>,
    sealed: DashMap<GroupKey, Instant>,
}

impl MediaGroupAggregator {
    pub fn new(quiet_period: Duration, sealed_retention: Duration) -> Self {
        Self {
            quiet_period,
            sealed_retention,
            buffers: DashMap::new(),
            sealed: DashMap::new(),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    pub fn ingest(&self, config: Arc<ReplicationConfig>, unit: InboundUnit) -> Result<Ingested> {
        self.ingest_at(config, unit, Instant::now())
    }

    /// Buffer one member. The unit must carry a media group id.
    pub fn ingest_at(
        &self,
        config: Arc<ReplicationConfig>,
        unit: InboundUnit,
        now: Instant,
    ) -> Result<Ingested> {
        let group_id = unit.media_group_id.clone().ok_or_else(|| {
            ReplicationError::Internal(format!(
                "message {} has no media group id",
                unit.message_id
            ))
        })?;
        let key = GroupKey::new(config.id, group_id);
        let deadline = now + self.quiet_period;

        // Lock order is always buffers then sealed; try_seal marks a group
        // sealed while holding the same buffer entry.
        let entry = self.buffers.entry(key.clone());
        if self.sealed.contains_key(&key) {
            drop(entry);
            warn!(group = %key, message_id = unit.message_id, "Stale member for sealed media group, dropping");
            metrics::record_stale_group_member(key.config_id);
            return Ok(Ingested::Stale { key });
        }

        let (opened, members) = match entry {
            Entry::Occupied(mut occupied) => {
                let buffer = occupied.get_mut();
                buffer.deadline = deadline;
                buffer.members.insert(unit.message_id, unit);
                (false, buffer.members.len())
            }
            Entry::Vacant(vacant) => {
                let source_chat_id = unit.source_chat_id;
                let mut members = BTreeMap::new();
                members.insert(unit.message_id, unit);
                vacant.insert(GroupBuffer {
                    config,
                    source_chat_id,
                    members,
                    deadline,
                });
                (true, 1)
            }
        };

        if opened {
            debug!(group = %key, "Media group opened");
            Ok(Ingested::Opened { key, deadline })
        } else {
            debug!(group = %key, members, "Media group member appended");
            Ok(Ingested::Appended { key, members })
        }
    }

    /// Seal the group if its quiet period has elapsed.
    pub fn try_seal(&self, key: &GroupKey, now: Instant) -> SealOutcome {
        let buffer = match self.buffers.entry(key.clone()) {
            Entry::Occupied(occupied) if occupied.get().deadline <= now => {
                self.sealed.insert(key.clone(), now);
                occupied.remove()
            }
            Entry::Occupied(occupied) => return SealOutcome::Pending(occupied.get().deadline),
            Entry::Vacant(_) => return SealOutcome::Missing,
        };

        SealOutcome::Sealed(build_batch(key, buffer))
    }

    pub fn is_sealed(&self, key: &GroupKey) -> bool {
        self.sealed.contains_key(key)
    }

    pub fn pending_groups(&self) -> usize {
        self.buffers.len()
    }

    /// Forget sealed ids older than the retention window.
    pub fn prune_sealed(&self, now: Instant) -> usize {
        let before = self.sealed.len();
        let retention = self.sealed_retention;
        self.sealed
            .retain(|_, sealed_at| now.saturating_duration_since(*sealed_at) < retention);
        before - self.sealed.len()
    }

    /// Drop every open buffer without sealing. Returns how many.
    pub fn cancel_all(&self) -> usize {
        let n = self.buffers.len();
        self.buffers.clear();
        n
    }
}

fn build_batch(key: &GroupKey, buffer: GroupBuffer) -> Result<MediaGroupBatch> {
    let members: Vec<InboundUnit> = buffer.members.into_values().collect();
    let caption = members
        .iter()
        .find_map(|m| m.content.text())
        .map(str::to_string);

    let mut items = Vec::with_capacity(members.len());
    let mut source_ids = Vec::with_capacity(members.len());
    for member in &members {
        match &member.content {
            Content::Media { kind, file_id, .. } if kind.allowed_in_album() => {
                items.push(MediaItem {
                    kind: *kind,
                    file_id: file_id.clone(),
                    caption: None,
                });
                source_ids.push(member.message_id);
            }
            other => {
                warn!(group = %key, message_id = member.message_id, kind = %other.kind(), "Member cannot be part of an album, skipping");
            }
        }
    }

    if items.is_empty() {
        return Err(ReplicationError::EmptyBatch {
            group_id: key.group_id.clone(),
        });
    }
    if let Some(first) = items.first_mut() {
        first.caption = caption.clone();
    }

    debug!(group = %key, items = items.len(), "Media group sealed");
    metrics::record_group_sealed(key.config_id, items.len());

    Ok(MediaGroupBatch {
        config: buffer.config,
        group_id: key.group_id.clone(),
        source_chat_id: buffer.source_chat_id,
        members,
        items,
        source_ids,
        caption,
    })
}
