// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound replication of one unit or sealed batch.
//!
//! # Dispatch by content
//!
//! | Content | Transport call |
//! |---------|----------------|
//! | text, photo, video, document, audio, voice, sticker, animation, video note | `copy_message` |
//! | location | `send_location` |
//! | contact | `send_contact` |
//! | poll | `send_poll` |
//! | sealed media group | `send_media_group` |
//! | other | not replicated (`UnsupportedContent`) |
//!
//! # Fan-out
//!
//! A config may target a destination channel and several groups. Each
//! destination is called in order; the first failure stops the pass and
//! is returned together with the destinations already reached, so a retry
//! only calls the ones still missing. An existing mapping with the same
//! content fingerprint counts as already delivered.
//!
//! Every call goes through the optional global throttle and the optional
//! per-destination circuit breaker.

use crate::circuit_breaker::DestinationCircuits;
use crate::config::ReplicationConfig;
use crate::error::ReplicationError;
use crate::event::{ChatId, Content, InboundUnit, MessageId};
use crate::media_group::MediaGroupBatch;
use crate::metrics;
use crate::queue::Payload;
use crate::resilience::TransportThrottle;
use crate::store::{DestinationRef, MappingStore, MessageMapping};
use crate::transport::Transport;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Message ids produced in one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub chat_id: ChatId,
    /// One id for a single message, one per item for a batch.
    pub message_ids: Vec<MessageId>,
}

/// A failed replication pass.
#[derive(Debug, Clone)]
pub struct ReplicationFailure {
    pub error: ReplicationError,
    /// Destinations reached before the failure (including earlier passes).
    pub delivered: Vec<Delivery>,
}

/// Successful pass summary.
#[derive(Debug, Clone)]
pub struct Replicated {
    pub deliveries: Vec<Delivery>,
    /// Time spent in transport calls during this pass.
    pub latency: Duration,
}

pub struct Replicator<T: Transport, S: MappingStore> {
    transport: Arc<T>,
    mappings: Arc<S>,
    throttle: Option<TransportThrottle>,
    circuits: Option<DestinationCircuits>,
}

impl<T: Transport, S: MappingStore> Replicator<T, S> {
    pub fn new(transport: Arc<T>, mappings: Arc<S>) -> Self {
        Self {
            transport,
            mappings,
            throttle: None,
            circuits: None,
        }
    }

    #[must_use]
    pub fn with_throttle(mut self, throttle: Option<TransportThrottle>) -> Self {
        self.throttle = throttle;
        self
    }

    #[must_use]
    pub fn with_circuits(mut self, circuits: Option<DestinationCircuits>) -> Self {
        self.circuits = circuits;
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn circuits(&self) -> Option<&DestinationCircuits> {
        self.circuits.as_ref()
    }

    /// Deliver `payload` to every destination of `config` not yet in
    /// `already`, then record mappings.
    pub async fn replicate(
        &self,
        config: &ReplicationConfig,
        payload: &Payload,
        already: &[Delivery],
    ) -> Result<Replicated, ReplicationFailure> {
        let destinations = config.destinations();
        if destinations.is_empty() {
            return Err(ReplicationFailure {
                error: ReplicationError::Config(format!("config {} has no destinations", config.id)),
                delivered: already.to_vec(),
            });
        }

        let mut delivered = already.to_vec();
        if let Payload::Single(unit) = payload {
            self.merge_existing_mapping(config, unit, &mut delivered).await;
        }

        let started = Instant::now();
        for destination in destinations {
            if delivered.iter().any(|d| d.chat_id == destination) {
                continue;
            }
            match self.send_to(destination, payload).await {
                Ok(message_ids) => {
                    debug!(config_id = config.id, destination, ids = ?message_ids, "Delivered");
                    delivered.push(Delivery {
                        chat_id: destination,
                        message_ids,
                    });
                }
                Err(error) => {
                    return Err(ReplicationFailure { error, delivered });
                }
            }
        }
        let latency = started.elapsed();
        metrics::record_replication_latency(config.id, latency);

        self.save_mappings(config, payload, &delivered).await;

        Ok(Replicated {
            deliveries: delivered,
            latency,
        })
    }

    /// Replay an edit onto one destination message.
    pub async fn replicate_edit(
        &self,
        destination: ChatId,
        target: MessageId,
        unit: &InboundUnit,
    ) -> Result<(), ReplicationError> {
        let (operation, text, is_caption) = match &unit.content {
            Content::Text { text } => ("edit_text", text.clone(), false),
            Content::Media { caption, .. } => {
                ("edit_caption", caption.clone().unwrap_or_default(), true)
            }
            other => {
                return Err(ReplicationError::UnsupportedContent(format!(
                    "edit of {}",
                    other.kind()
                )))
            }
        };

        self.guarded(destination, || async move {
            let result = if is_caption {
                self.transport.edit_caption(destination, target, text).await
            } else {
                self.transport.edit_text(destination, target, text).await
            };
            result.map_err(|e| ReplicationError::transport(operation, e))
        })
        .await
    }

    async fn send_to(
        &self,
        destination: ChatId,
        payload: &Payload,
    ) -> Result<Vec<MessageId>, ReplicationError> {
        match payload {
            Payload::Single(unit) => {
                self.guarded(destination, || self.send_unit(destination, unit))
                    .await
                    .map(|id| vec![id])
            }
            Payload::Batch(batch) => {
                self.guarded(destination, || self.send_batch(destination, batch))
                    .await
            }
        }
    }

    /// Throttle, then run the call through the destination's breaker.
    async fn guarded<F, Fut, R>(&self, destination: ChatId, f: F) -> Result<R, ReplicationError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<R, ReplicationError>>,
    {
        if let Some(throttle) = &self.throttle {
            throttle.acquire().await;
        }
        match &self.circuits {
            Some(circuits) => circuits.guard(destination, f()).await,
            None => f().await,
        }
    }

    async fn send_unit(&self, to: ChatId, unit: &InboundUnit) -> Result<MessageId, ReplicationError> {
        let t = &self.transport;
        match &unit.content {
            Content::Text { .. } | Content::Media { .. } => t
                .copy_message(to, unit.source_chat_id, unit.message_id)
                .await
                .map_err(|e| ReplicationError::transport("copy_message", e)),
            Content::Location(location) => t
                .send_location(to, location.clone())
                .await
                .map_err(|e| ReplicationError::transport("send_location", e)),
            Content::Contact(contact) => t
                .send_contact(to, contact.clone())
                .await
                .map_err(|e| ReplicationError::transport("send_contact", e)),
            Content::Poll(poll) => t
                .send_poll(to, poll.clone())
                .await
                .map_err(|e| ReplicationError::transport("send_poll", e)),
            Content::Other => Err(ReplicationError::UnsupportedContent(
                unit.kind().as_str().to_string(),
            )),
        }
    }

    async fn send_batch(
        &self,
        to: ChatId,
        batch: &MediaGroupBatch,
    ) -> Result<Vec<MessageId>, ReplicationError> {
        if batch.is_empty() {
            return Err(ReplicationError::EmptyBatch {
                group_id: batch.group_id.clone(),
            });
        }
        self.transport
            .send_media_group(to, batch.items.clone())
            .await
            .map_err(|e| ReplicationError::transport("send_media_group", e))
    }

    async fn merge_existing_mapping(
        &self,
        config: &ReplicationConfig,
        unit: &InboundUnit,
        delivered: &mut Vec<Delivery>,
    ) {
        match self.mappings.get_mapping(config.id, unit.message_id).await {
            Ok(Some(mapping)) if mapping.fingerprint == unit.fingerprint => {
                for dest in mapping.destinations {
                    if !delivered.iter().any(|d| d.chat_id == dest.chat_id) {
                        debug!(config_id = config.id, destination = dest.chat_id, "Already cloned, skipping destination");
                        delivered.push(Delivery {
                            chat_id: dest.chat_id,
                            message_ids: vec![dest.message_id],
                        });
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(config_id = config.id, error = %e, "Mapping lookup failed, cloning anyway");
            }
        }
    }

    async fn save_mappings(&self, config: &ReplicationConfig, payload: &Payload, delivered: &[Delivery]) {
        for mapping in build_mappings(config, payload, delivered) {
            let source = mapping.source_message_id;
            if let Err(e) = self.mappings.save_mapping(mapping).await {
                warn!(config_id = config.id, source_message_id = source, error = %e, "Failed to record mapping");
                metrics::record_mapping_write_failure(config.id);
            }
        }
    }
}

/// One mapping per source message. Batch member `i` maps to the `i`-th
/// id returned by each destination.
fn build_mappings(
    config: &ReplicationConfig,
    payload: &Payload,
    delivered: &[Delivery],
) -> Vec<MessageMapping> {
    let now = Utc::now();
    match payload {
        Payload::Single(unit) => vec![MessageMapping {
            config_id: config.id,
            source_message_id: unit.message_id,
            destinations: delivered
                .iter()
                .filter_map(|d| {
                    d.message_ids.first().map(|&message_id| DestinationRef {
                        chat_id: d.chat_id,
                        message_id,
                    })
                })
                .collect(),
            kind: unit.kind(),
            fingerprint: unit.fingerprint.clone(),
            media_group_id: None,
            created_at: now,
        }],
        Payload::Batch(batch) => batch
            .source_ids
            .iter()
            .enumerate()
            .filter_map(|(i, &source_id)| {
                let member = batch.members.iter().find(|m| m.message_id == source_id)?;
                Some(MessageMapping {
                    config_id: config.id,
                    source_message_id: source_id,
                    destinations: delivered
                        .iter()
                        .filter_map(|d| {
                            d.message_ids.get(i).map(|&message_id| DestinationRef {
                                chat_id: d.chat_id,
                                message_id,
                            })
                        })
                        .collect(),
                    kind: member.kind(),
                    fingerprint: member.fingerprint.clone(),
                    media_group_id: Some(batch.group_id.clone()),
                    created_at: now,
                })
            })
            .collect(),
    }
}
