// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound platform events and their normalized form.
//!
//! The transport delivers four event kinds: new and edited posts, each in
//! a channel-scoped and a group-scoped variant. Every event is normalized
//! to an [`InboundUnit`] before entering the pipeline.
//!
//! # Content Fingerprint
//!
//! The platform may reuse numeric message ids, so identity alone is not
//! enough to recognise a duplicate. Each unit carries a hex SHA-256
//! fingerprint over its content kind, textual payload, and attached file
//! ids. The dedup key combines identity, timestamp, and fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Platform chat identifier (channels and groups are negative).
pub type ChatId = i64;

/// Platform message identifier, unique within a chat.
pub type MessageId = i32;

/// Inbound event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChannelPost,
    EditedChannelPost,
    GroupMessage,
    EditedGroupMessage,
}

impl EventKind {
    /// Whether this event edits an already published message.
    pub fn is_edit(self) -> bool {
        matches!(self, Self::EditedChannelPost | Self::EditedGroupMessage)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChannelPost => "channel_post",
            Self::EditedChannelPost => "edited_channel_post",
            Self::GroupMessage => "group_message",
            Self::EditedGroupMessage => "edited_group_message",
        }
    }
}

/// Media kinds that carry a platform file id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    Animation,
    VideoNote,
}

impl MediaKind {
    /// Kinds the platform accepts inside a multi-item album.
    pub fn allowed_in_album(self) -> bool {
        matches!(self, Self::Photo | Self::Video | Self::Document | Self::Audio)
    }
}

/// A media attachment as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub phone_number: String,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub question: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub allows_multiple_answers: bool,
}

/// Raw message view handed over by the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    /// Unix timestamp of the original post.
    pub date: i64,
    /// Unix timestamp of the last edit, for edited events.
    #[serde(default)]
    pub edit_date: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media: Option<MediaAttachment>,
    #[serde(default)]
    pub media_group_id: Option<String>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub contact: Option<Contact>,
    #[serde(default)]
    pub poll: Option<Poll>,
}

/// One event from the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub message: PlatformMessage,
}

impl InboundEvent {
    pub fn new(kind: EventKind, message: PlatformMessage) -> Self {
        Self { kind, message }
    }
}

/// Flat content kind label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    Animation,
    VideoNote,
    Location,
    Contact,
    Poll,
    Other,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::Sticker => "sticker",
            Self::Animation => "animation",
            Self::VideoNote => "video_note",
            Self::Location => "location",
            Self::Contact => "contact",
            Self::Poll => "poll",
            Self::Other => "other",
        }
    }
}

impl From<MediaKind> for ContentKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Photo => Self::Photo,
            MediaKind::Video => Self::Video,
            MediaKind::Document => Self::Document,
            MediaKind::Audio => Self::Audio,
            MediaKind::Voice => Self::Voice,
            MediaKind::Sticker => Self::Sticker,
            MediaKind::Animation => Self::Animation,
            MediaKind::VideoNote => Self::VideoNote,
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message content as a tagged union.
///
/// Structured kinds carry their payload because they are re-sent rather
/// than copied.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text {
        text: String,
    },
    Media {
        kind: MediaKind,
        file_id: String,
        caption: Option<String>,
    },
    Location(Location),
    Contact(Contact),
    Poll(Poll),
    Other,
}

impl Content {
    /// Classify a raw message. Media wins over structured payloads, and
    /// plain text is the fallback.
    pub fn from_message(message: &PlatformMessage) -> Self {
        if let Some(media) = &message.media {
            return Self::Media {
                kind: media.kind,
                file_id: media.file_id.clone(),
                caption: message.caption.clone(),
            };
        }
        if let Some(location) = &message.location {
            return Self::Location(location.clone());
        }
        if let Some(contact) = &message.contact {
            return Self::Contact(contact.clone());
        }
        if let Some(poll) = &message.poll {
            return Self::Poll(poll.clone());
        }
        match &message.text {
            Some(text) => Self::Text { text: text.clone() },
            None => Self::Other,
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Text { .. } => ContentKind::Text,
            Self::Media { kind, .. } => (*kind).into(),
            Self::Location(_) => ContentKind::Location,
            Self::Contact(_) => ContentKind::Contact,
            Self::Poll(_) => ContentKind::Poll,
            Self::Other => ContentKind::Other,
        }
    }

    /// Text for text messages, caption for media.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Media { caption, .. } => caption.as_deref(),
            _ => None,
        }
    }

    /// Hex SHA-256 over kind, textual payload, and file identifiers.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind().as_str().as_bytes());
        hasher.update([0u8]);
        match self {
            Self::Text { text } => hasher.update(text.as_bytes()),
            Self::Media {
                file_id, caption, ..
            } => {
                hasher.update(caption.as_deref().unwrap_or_default().as_bytes());
                hasher.update([0u8]);
                hasher.update(file_id.as_bytes());
            }
            Self::Location(l) => {
                hasher.update(l.latitude.to_le_bytes());
                hasher.update(l.longitude.to_le_bytes());
            }
            Self::Contact(c) => {
                hasher.update(c.phone_number.as_bytes());
                hasher.update([0u8]);
                hasher.update(c.first_name.as_bytes());
            }
            Self::Poll(p) => {
                hasher.update(p.question.as_bytes());
                for option in &p.options {
                    hasher.update([0u8]);
                    hasher.update(option.as_bytes());
                }
            }
            Self::Other => {}
        }
        hex::encode(hasher.finalize())
    }
}

/// Normalized view of one platform event.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundUnit {
    pub source_chat_id: ChatId,
    pub message_id: MessageId,
    /// Edit timestamp for edits, post timestamp otherwise.
    pub timestamp: i64,
    pub edited: bool,
    pub content: Content,
    pub media_group_id: Option<String>,
    pub fingerprint: String,
}

impl InboundUnit {
    pub fn from_event(event: &InboundEvent) -> Self {
        let message = &event.message;
        let content = Content::from_message(message);
        let fingerprint = content.fingerprint();
        let edited = event.kind.is_edit();
        let timestamp = if edited {
            message.edit_date.unwrap_or(message.date)
        } else {
            message.date
        };

        Self {
            source_chat_id: message.chat_id,
            message_id: message.message_id,
            timestamp,
            edited,
            content,
            media_group_id: message.media_group_id.clone(),
            fingerprint,
        }
    }

    pub fn kind(&self) -> ContentKind {
        self.content.kind()
    }

    /// Composite identity used by the dedup filter.
    ///
    /// Edits are tagged separately so an edit that restores the original
    /// text is not mistaken for the original post.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.source_chat_id,
            self.message_id,
            self.timestamp,
            if self.edited { "e" } else { "n" },
            self.fingerprint
        )
    }
}
