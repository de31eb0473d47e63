//! Edit synchronization.
//!
//! Source edits are replayed onto every destination message recorded in
//! the mapping. Edits bypass dedup-then-aggregate-then-schedule: they go
//! straight from the dedup filter to here, and are not rate limited.
//!
//! | Situation | Result |
//! |-----------|--------|
//! | config has `edit_sync` off | `Disabled`, nothing sent |
//! | edited message belongs to a media group | `Unsupported`, logged |
//! | no mapping (never cloned, or clone failed) | `NoMapping`, logged at info |
//! | every destination edited | `Synced` |
//! | any destination edit failed | `Failed` |

use crate::config::ReplicationConfig;
use crate::error::ReplicationError;
use crate::event::InboundUnit;
use crate::metrics;
use crate::replicator::Replicator;
use crate::store::{record_action, Action, ActionLogEntry, Store};
use crate::transport::Transport;
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    Synced { destinations: usize },
    Disabled,
    Unsupported,
    NoMapping,
    Failed(ReplicationError),
}

impl EditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced { .. } => "synced",
            Self::Disabled => "disabled",
            Self::Unsupported => "unsupported",
            Self::NoMapping => "no_mapping",
            Self::Failed(_) => "failed",
        }
    }
}

pub struct EditSynchronizer<T: Transport, S: Store> {
    replicator: Arc<Replicator<T, S>>,
    store: Arc<S>,
}

impl<T: Transport, S: Store> EditSynchronizer<T, S> {
    pub fn new(replicator: Arc<Replicator<T, S>>, store: Arc<S>) -> Self {
        Self { replicator, store }
    }

    pub async fn sync_edit(&self, config: &ReplicationConfig, unit: &InboundUnit) -> EditOutcome {
        let outcome = self.sync_inner(config, unit).await;
        if !matches!(outcome, EditOutcome::Disabled) {
            metrics::record_edit_sync(config.id, outcome.as_str());
        }
        outcome
    }

    async fn sync_inner(&self, config: &ReplicationConfig, unit: &InboundUnit) -> EditOutcome {
        if !config.edit_sync {
            debug!(config_id = config.id, message_id = unit.message_id, "Edit sync disabled");
            return EditOutcome::Disabled;
        }

        if let Some(group_id) = &unit.media_group_id {
            info!(config_id = config.id, message_id = unit.message_id, group_id = %group_id, "Media group edits are not synchronized");
            return EditOutcome::Unsupported;
        }

        let mapping = match self.store.get_mapping(config.id, unit.message_id).await {
            Ok(Some(mapping)) => mapping,
            Ok(None) => {
                info!(config_id = config.id, message_id = unit.message_id, "No mapping for edited message, skipping");
                return EditOutcome::NoMapping;
            }
            Err(e) => {
                warn!(config_id = config.id, message_id = unit.message_id, error = %e, "Mapping lookup failed");
                self.audit(config, unit, false, Some(&e), Instant::now()).await;
                return EditOutcome::Failed(e);
            }
        };

        if mapping.media_group_id.is_some() {
            info!(config_id = config.id, message_id = unit.message_id, "Edited message was cloned as part of an album, skipping");
            return EditOutcome::Unsupported;
        }

        let started = Instant::now();
        let mut first_error = None;
        for dest in &mapping.destinations {
            if let Err(e) = self
                .replicator
                .replicate_edit(dest.chat_id, dest.message_id, unit)
                .await
            {
                warn!(config_id = config.id, destination = dest.chat_id, error = %e, "Edit sync failed for destination");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => {
                debug!(config_id = config.id, message_id = unit.message_id, destinations = mapping.destinations.len(), "Edit synced");
                self.audit(config, unit, true, None, started).await;
                EditOutcome::Synced {
                    destinations: mapping.destinations.len(),
                }
            }
            Some(e) => {
                self.audit(config, unit, false, Some(&e), started).await;
                EditOutcome::Failed(e)
            }
        }
    }

    async fn audit(
        &self,
        config: &ReplicationConfig,
        unit: &InboundUnit,
        success: bool,
        error: Option<&ReplicationError>,
        started: Instant,
    ) {
        let action = if success {
            Action::EditSyncSuccess
        } else {
            Action::EditSyncError
        };
        let entry = ActionLogEntry::new(config.id, action, success)
            .with_latency(started.elapsed())
            .with_context(json!({
                "source_message_id": unit.message_id,
                "kind": unit.kind().as_str(),
                "error": error.map(|e| e.to_string()),
            }));
        record_action(self.store.as_ref(), entry).await;
    }
}
