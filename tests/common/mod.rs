//! Shared test utilities for pipeline and chaos tests.
//!
//! This module provides:
//! - A recording [`MockTransport`] with scripted failures
//! - Event builders for posts, album members and edits
//! - Engine setup over an [`InMemoryStore`]

pub mod mock_transport;

pub use mock_transport::*;

use channel_replication::event::{MediaAttachment, MediaKind};
use channel_replication::{
    EngineConfig, EventKind, InMemoryStore, InboundEvent, MessageId, PlatformMessage, ReplicationConfig,
    ReplicationEngine,
};
use std::sync::Arc;

pub const SOURCE: i64 = -1001;
pub const DEST: i64 = -2001;

/// Unix time all test posts pretend to be from.
pub const POST_DATE: i64 = 1_700_000_000;

pub type TestEngine = ReplicationEngine<MockTransport, InMemoryStore>;

pub struct Harness {
    pub engine: TestEngine,
    pub transport: Arc<MockTransport>,
    pub store: Arc<InMemoryStore>,
}

/// Start an engine with test timings over the given configs.
pub async fn harness(configs: Vec<ReplicationConfig>) -> Harness {
    harness_with(EngineConfig::for_testing("test"), configs).await
}

pub async fn harness_with(config: EngineConfig, configs: Vec<ReplicationConfig>) -> Harness {
    let transport = Arc::new(MockTransport::new());
    let store = Arc::new(InMemoryStore::with_configs(configs));
    let mut engine = ReplicationEngine::new(config, Arc::clone(&transport), Arc::clone(&store));
    engine.start().await.expect("engine start");
    Harness {
        engine,
        transport,
        store,
    }
}

/// Immediate-mode config from [`SOURCE`] to [`DEST`] with the given rate.
pub fn immediate(id: i64, rate_per_minute: u32) -> ReplicationConfig {
    let mut config = ReplicationConfig::new(id, SOURCE, DEST);
    config.rate_limit_per_minute = rate_per_minute;
    config
}

pub fn sequential(id: i64) -> ReplicationConfig {
    let mut config = ReplicationConfig::new(id, SOURCE, DEST);
    config.sequential = true;
    config.rate_limit_per_minute = 0;
    config
}

pub fn delayed(id: i64, delay_seconds: u64) -> ReplicationConfig {
    let mut config = ReplicationConfig::new(id, SOURCE, DEST);
    config.delay_seconds = delay_seconds;
    config.rate_limit_per_minute = 0;
    config
}

pub fn text_post(message_id: MessageId, text: &str) -> InboundEvent {
    InboundEvent::new(
        EventKind::ChannelPost,
        PlatformMessage {
            chat_id: SOURCE,
            message_id,
            date: POST_DATE,
            text: Some(text.to_string()),
            ..Default::default()
        },
    )
}

pub fn photo_post(message_id: MessageId) -> InboundEvent {
    InboundEvent::new(
        EventKind::ChannelPost,
        PlatformMessage {
            chat_id: SOURCE,
            message_id,
            date: POST_DATE,
            media: Some(MediaAttachment {
                kind: MediaKind::Photo,
                file_id: format!("photo-{}", message_id),
            }),
            ..Default::default()
        },
    )
}

pub fn album_member(message_id: MessageId, group: &str, caption: Option<&str>) -> InboundEvent {
    InboundEvent::new(
        EventKind::ChannelPost,
        PlatformMessage {
            chat_id: SOURCE,
            message_id,
            date: POST_DATE,
            caption: caption.map(str::to_string),
            media: Some(MediaAttachment {
                kind: MediaKind::Photo,
                file_id: format!("photo-{}", message_id),
            }),
            media_group_id: Some(group.to_string()),
            ..Default::default()
        },
    )
}

pub fn text_edit(message_id: MessageId, text: &str) -> InboundEvent {
    InboundEvent::new(
        EventKind::EditedChannelPost,
        PlatformMessage {
            chat_id: SOURCE,
            message_id,
            date: POST_DATE,
            edit_date: Some(POST_DATE + 60),
            text: Some(text.to_string()),
            ..Default::default()
        },
    )
}
