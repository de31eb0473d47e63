// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Platform transport seam.
//!
//! The transport client performs the actual network calls. The pipeline
//! only needs the outbound operations listed on [`Transport`]; each one
//! returns the destination message id(s) or a [`TransportError`].
//!
//! # Example
//!
//! ```rust,no_run
//! use channel_replication::transport::{BoxFuture, MediaItem, Transport};
//! use channel_replication::event::{ChatId, Contact, Location, MessageId, Poll};
//!
//! struct MyClient;
//!
//! impl Transport for MyClient {
//!     fn copy_message(&self, _to: ChatId, _from: ChatId, _id: MessageId) -> BoxFuture<'_, MessageId> {
//!         Box::pin(async { Ok(1) })
//!     }
//!     fn send_location(&self, _to: ChatId, _l: Location) -> BoxFuture<'_, MessageId> {
//!         Box::pin(async { Ok(1) })
//!     }
//!     fn send_contact(&self, _to: ChatId, _c: Contact) -> BoxFuture<'_, MessageId> {
//!         Box::pin(async { Ok(1) })
//!     }
//!     fn send_poll(&self, _to: ChatId, _p: Poll) -> BoxFuture<'_, MessageId> {
//!         Box::pin(async { Ok(1) })
//!     }
//!     fn send_media_group(&self, _to: ChatId, items: Vec<MediaItem>) -> BoxFuture<'_, Vec<MessageId>> {
//!         Box::pin(async move { Ok((1..=items.len() as MessageId).collect()) })
//!     }
//!     fn edit_text(&self, _chat: ChatId, _id: MessageId, _text: String) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn edit_caption(&self, _chat: ChatId, _id: MessageId, _caption: String) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//! ```

use crate::event::{ChatId, Contact, Location, MediaKind, MessageId, Poll};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

/// Result type for transport calls.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Boxed transport future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = TransportResult<T>> + Send + 'a>>;

/// A failed transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// Human-readable cause.
    pub message: String,
    /// Wait suggested by the platform when it throttled us.
    pub retry_after: Option<Duration>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Platform flood-control response.
    pub fn throttled(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.retry_after {
            Some(wait) => write!(f, "{} (retry after {:?})", self.message, wait),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TransportError {}

/// One item of an outbound multi-item post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub file_id: String,
    /// Only the first item of an album carries the caption.
    #[serde(default)]
    pub caption: Option<String>,
}

/// Outbound operations the pipeline needs from the platform client.
pub trait Transport: Send + Sync + 'static {
    /// Copy a message verbatim from `from` into `to`.
    fn copy_message(&self, to: ChatId, from: ChatId, message_id: MessageId)
        -> BoxFuture<'_, MessageId>;

    fn send_location(&self, to: ChatId, location: Location) -> BoxFuture<'_, MessageId>;

    fn send_contact(&self, to: ChatId, contact: Contact) -> BoxFuture<'_, MessageId>;

    fn send_poll(&self, to: ChatId, poll: Poll) -> BoxFuture<'_, MessageId>;

    /// Send a multi-item post. Returns one id per item, in item order.
    fn send_media_group(&self, to: ChatId, items: Vec<MediaItem>) -> BoxFuture<'_, Vec<MessageId>>;

    fn edit_text(&self, chat: ChatId, message_id: MessageId, text: String) -> BoxFuture<'_, ()>;

    fn edit_caption(&self, chat: ChatId, message_id: MessageId, caption: String)
        -> BoxFuture<'_, ()>;
}

/// Logs calls and returns synthetic ids.
#[derive(Debug)]
pub struct NoOpTransport {
    next_id: AtomicI32,
}

impl Default for NoOpTransport {
    fn default() -> Self {
        Self {
            next_id: AtomicI32::new(1),
        }
    }
}

impl NoOpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self, count: usize) -> Vec<MessageId> {
        let first = self.next_id.fetch_add(count as i32, Ordering::Relaxed);
        (first..first + count as i32).collect()
    }

    fn one(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Transport for NoOpTransport {
    fn copy_message(&self, to: ChatId, from: ChatId, message_id: MessageId) -> BoxFuture<'_, MessageId> {
        Box::pin(async move {
            tracing::debug!(to, from, message_id, "NoOp: would copy message");
            Ok(self.one())
        })
    }

    fn send_location(&self, to: ChatId, location: Location) -> BoxFuture<'_, MessageId> {
        Box::pin(async move {
            tracing::debug!(to, lat = location.latitude, lon = location.longitude, "NoOp: would send location");
            Ok(self.one())
        })
    }

    fn send_contact(&self, to: ChatId, contact: Contact) -> BoxFuture<'_, MessageId> {
        Box::pin(async move {
            tracing::debug!(to, name = %contact.first_name, "NoOp: would send contact");
            Ok(self.one())
        })
    }

    fn send_poll(&self, to: ChatId, poll: Poll) -> BoxFuture<'_, MessageId> {
        Box::pin(async move {
            tracing::debug!(to, options = poll.options.len(), "NoOp: would send poll");
            Ok(self.one())
        })
    }

    fn send_media_group(&self, to: ChatId, items: Vec<MediaItem>) -> BoxFuture<'_, Vec<MessageId>> {
        Box::pin(async move {
            tracing::debug!(to, items = items.len(), "NoOp: would send media group");
            Ok(self.allocate(items.len()))
        })
    }

    fn edit_text(&self, chat: ChatId, message_id: MessageId, text: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::debug!(chat, message_id, len = text.len(), "NoOp: would edit text");
            Ok(())
        })
    }

    fn edit_caption(&self, chat: ChatId, message_id: MessageId, caption: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::debug!(chat, message_id, len = caption.len(), "NoOp: would edit caption");
            Ok(())
        })
    }
}
