//! External persistence seams and the in-process config cache.
//!
//! Three collaborators live outside the pipeline:
//!
//! - [`ConfigStore`]: replication configs, edited through the admin surface
//! - [`MappingStore`]: source message → destination message records
//! - [`ActionLog`]: append-only audit trail of terminal outcomes
//!
//! [`ConfigCache`] fronts the config store with a short TTL so the hot path
//! does not hit storage per event. [`InMemoryStore`] implements all three
//! traits for tests and standalone deployments.

use crate::config::{validate_unique_sources, ConfigId, ReplicationConfig};
use crate::error::{ReplicationError, Result};
use crate::event::{ChatId, ContentKind, MessageId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Boxed store future.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

// =============================================================================
// Records
// =============================================================================

/// Where one source message landed in one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Mapping from a source message to the messages it produced.
///
/// Unique per `(config_id, source_message_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMapping {
    pub config_id: ConfigId,
    pub source_message_id: MessageId,
    pub destinations: Vec<DestinationRef>,
    pub kind: ContentKind,
    /// Fingerprint of the content that was cloned. A reused source id with
    /// different content does not match.
    pub fingerprint: String,
    #[serde(default)]
    pub media_group_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageMapping {
    /// Destination message id in `chat`, if this mapping reached it.
    pub fn target_in(&self, chat: ChatId) -> Option<MessageId> {
        self.destinations
            .iter()
            .find(|d| d.chat_id == chat)
            .map(|d| d.message_id)
    }
}

/// Audited action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CloneSuccess,
    CloneError,
    RateLimited,
    Queued,
    Retried,
    EditSyncSuccess,
    EditSyncError,
    GroupDropped,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CloneSuccess => "clone_success",
            Self::CloneError => "clone_error",
            Self::RateLimited => "rate_limited",
            Self::Queued => "queued",
            Self::Retried => "retried",
            Self::EditSyncSuccess => "edit_sync_success",
            Self::EditSyncError => "edit_sync_error",
            Self::GroupDropped => "group_dropped",
        }
    }
}

/// One action log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub config_id: ConfigId,
    pub action: Action,
    pub success: bool,
    pub latency: Duration,
    pub context: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl ActionLogEntry {
    pub fn new(config_id: ConfigId, action: Action, success: bool) -> Self {
        Self {
            config_id,
            action,
            success,
            latency: Duration::ZERO,
            context: serde_json::Value::Null,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Read access to replication configs.
pub trait ConfigStore: Send + Sync + 'static {
    /// All configs whose source is `source`, including disabled and
    /// soft-deleted ones. Filtering happens in [`ConfigCache`].
    fn configs_for_source(&self, source: ChatId) -> StoreFuture<'_, Vec<ReplicationConfig>>;
}

/// Persistence for message mappings.
pub trait MappingStore: Send + Sync + 'static {
    fn get_mapping(
        &self,
        config_id: ConfigId,
        source_message_id: MessageId,
    ) -> StoreFuture<'_, Option<MessageMapping>>;

    /// Insert or replace the mapping for its key.
    fn save_mapping(&self, mapping: MessageMapping) -> StoreFuture<'_, ()>;
}

/// Append-only audit log.
pub trait ActionLog: Send + Sync + 'static {
    fn record(&self, entry: ActionLogEntry) -> StoreFuture<'_, ()>;
}

/// Everything the engine needs from storage.
pub trait Store: ConfigStore + MappingStore + ActionLog {}

impl<S: ConfigStore + MappingStore + ActionLog> Store for S {}

/// Append to the action log. A log failure never fails the caller.
pub async fn record_action<L: ActionLog + ?Sized>(log: &L, entry: ActionLogEntry) {
    let config_id = entry.config_id;
    let action = entry.action;
    if let Err(e) = log.record(entry).await {
        warn!(config_id, action = action.as_str(), error = %e, "Failed to write action log entry");
    }
}

// =============================================================================
// Config cache
// =============================================================================

struct CachedConfigs {
    configs: Arc<Vec<ReplicationConfig>>,
    loaded_at: Instant,
}

/// TTL cache of active configs keyed by source chat.
pub struct ConfigCache<S: ConfigStore> {
    store: Arc<S>,
    ttl: Duration,
    entries: DashMap<ChatId, CachedConfigs>,
}

impl<S: ConfigStore> ConfigCache<S> {
    pub fn new(store: Arc<S>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Active configs for `source`. Empty when the channel is unconfigured.
    pub async fn resolve(&self, source: ChatId) -> Result<Arc<Vec<ReplicationConfig>>> {
        if let Some(entry) = self.entries.get(&source) {
            if entry.loaded_at.elapsed() < self.ttl {
                return Ok(entry.configs.clone());
            }
        }

        let loaded = self.store.configs_for_source(source).await?;
        let active: Vec<_> = loaded
            .into_iter()
            .filter(|c| c.is_active())
            .filter(|c| match c.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(config_id = c.id, error = %e, "Invalid config skipped");
                    false
                }
            })
            .collect();
        if let Err(e) = validate_unique_sources(&active) {
            warn!(source, error = %e, "Conflicting configs for source, replicating with all of them");
        }
        debug!(source, configs = active.len(), "Config cache refreshed");

        let configs = Arc::new(active);
        self.entries.insert(
            source,
            CachedConfigs {
                configs: configs.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(configs)
    }

    /// Drop the cached entry for one source (after an admin edit).
    pub fn invalidate(&self, source: ChatId) {
        self.entries.remove(&source);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Process-local store. Also serves as the admin surface in tests.
#[derive(Default)]
pub struct InMemoryStore {
    configs: RwLock<Vec<ReplicationConfig>>,
    mappings: DashMap<(ConfigId, MessageId), MessageMapping>,
    actions: Mutex<Vec<ActionLogEntry>>,
    fail_mapping_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configs(configs: Vec<ReplicationConfig>) -> Self {
        let store = Self::new();
        for config in configs {
            store.upsert_config(config);
        }
        store
    }

    /// Create or replace a config by id.
    pub fn upsert_config(&self, config: ReplicationConfig) {
        let mut configs = self.configs.write().unwrap_or_else(|e| e.into_inner());
        match configs.iter_mut().find(|c| c.id == config.id) {
            Some(existing) => *existing = config,
            None => configs.push(config),
        }
    }

    /// Soft-delete. Returns whether the config existed.
    pub fn delete_config(&self, id: ConfigId) -> bool {
        self.update_config(id, |c| c.deleted = true)
    }

    /// Enable or disable. Returns whether the config existed.
    pub fn toggle_config(&self, id: ConfigId, enabled: bool) -> bool {
        self.update_config(id, |c| c.enabled = enabled)
    }

    fn update_config(&self, id: ConfigId, f: impl FnOnce(&mut ReplicationConfig)) -> bool {
        let mut configs = self.configs.write().unwrap_or_else(|e| e.into_inner());
        match configs.iter_mut().find(|c| c.id == id) {
            Some(config) => {
                f(config);
                true
            }
            None => false,
        }
    }

    pub fn configs(&self) -> Vec<ReplicationConfig> {
        self.configs.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn mapping(&self, config_id: ConfigId, source_message_id: MessageId) -> Option<MessageMapping> {
        self.mappings
            .get(&(config_id, source_message_id))
            .map(|m| m.clone())
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    pub fn actions(&self) -> Vec<ActionLogEntry> {
        self.actions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn actions_of(&self, action: Action) -> Vec<ActionLogEntry> {
        self.actions()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }

    /// Make subsequent `save_mapping` calls fail.
    pub fn set_fail_mapping_writes(&self, fail: bool) {
        self.fail_mapping_writes.store(fail, Ordering::SeqCst);
    }
}

impl ConfigStore for InMemoryStore {
    fn configs_for_source(&self, source: ChatId) -> StoreFuture<'_, Vec<ReplicationConfig>> {
        let configs = self
            .configs()
            .into_iter()
            .filter(|c| c.source_channel_id == source)
            .collect();
        Box::pin(async move { Ok(configs) })
    }
}

impl MappingStore for InMemoryStore {
    fn get_mapping(
        &self,
        config_id: ConfigId,
        source_message_id: MessageId,
    ) -> StoreFuture<'_, Option<MessageMapping>> {
        Box::pin(async move { Ok(self.mapping(config_id, source_message_id)) })
    }

    fn save_mapping(&self, mapping: MessageMapping) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if self.fail_mapping_writes.load(Ordering::SeqCst) {
                return Err(ReplicationError::MappingStore(
                    "mapping writes disabled".to_string(),
                ));
            }
            self.mappings
                .insert((mapping.config_id, mapping.source_message_id), mapping);
            Ok(())
        })
    }
}

impl ActionLog for InMemoryStore {
    fn record(&self, entry: ActionLogEntry) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.actions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(entry);
            Ok(())
        })
    }
}
