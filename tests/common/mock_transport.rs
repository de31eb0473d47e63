//! Mock Transport for testing.
//!
//! Records every outbound call in order and fails scripted calls.
//! Each call logs a `Started` and a `Finished` entry so tests can check
//! that one delivery completed before the next one began.

use channel_replication::event::{Contact, Location, Poll};
use channel_replication::{BoxFuture, ChatId, MediaItem, MessageId, Transport, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// A recorded outbound call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Copy {
        to: ChatId,
        from: ChatId,
        message_id: MessageId,
    },
    Location {
        to: ChatId,
    },
    Contact {
        to: ChatId,
    },
    Poll {
        to: ChatId,
        question: String,
    },
    MediaGroup {
        to: ChatId,
        items: Vec<MediaItem>,
    },
    EditText {
        chat: ChatId,
        message_id: MessageId,
        text: String,
    },
    EditCaption {
        chat: ChatId,
        message_id: MessageId,
        caption: String,
    },
}

/// Call lifecycle marker, keyed by source message id for copies and by
/// destination chat for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Started(i64),
    Finished(i64),
}

/// Mock implementation of Transport that records all calls.
///
/// # Example
/// ```rust,ignore
/// let mock = MockTransport::new();
/// mock.fail_copies_of(7, 2); // message 7 fails twice, then succeeds
///
/// // Use in tests...
///
/// assert_eq!(mock.copies_of(7), 3);
/// ```
pub struct MockTransport {
    calls: Mutex<Vec<(Instant, Call)>>,
    marks: Mutex<Vec<Mark>>,
    /// Source message id -> remaining scripted failures.
    copy_failures: Mutex<HashMap<i64, u32>>,
    /// Destination chat -> remaining scripted failures (any operation).
    chat_failures: Mutex<HashMap<ChatId, u32>>,
    latency: Mutex<Duration>,
    next_id: AtomicI32,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            marks: Mutex::new(Vec::new()),
            copy_failures: Mutex::new(HashMap::new()),
            chat_failures: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            next_id: AtomicI32::new(1000),
        }
    }

    /// Copies of `message_id` fail `times` times before succeeding.
    pub fn fail_copies_of(&self, message_id: MessageId, times: u32) {
        self.copy_failures
            .lock()
            .unwrap()
            .insert(i64::from(message_id), times);
    }

    /// Any call into `chat` fails `times` times before succeeding.
    pub fn fail_chat(&self, chat: ChatId, times: u32) {
        self.chat_failures.lock().unwrap().insert(chat, times);
    }

    /// Every call takes this long.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    // =========================================================================
    // Assertions
    // =========================================================================

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn marks(&self) -> Vec<Mark> {
        self.marks.lock().unwrap().clone()
    }

    /// Copy attempts (failed ones included) of one source message.
    pub fn copies_of(&self, message_id: MessageId) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Copy { message_id: id, .. } if *id == message_id))
            .count()
    }

    pub fn media_groups(&self) -> Vec<(ChatId, Vec<MediaItem>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::MediaGroup { to, items } => Some((to, items)),
                _ => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::EditText { .. } | Call::EditCaption { .. }))
            .collect()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn take_failure(map: &Mutex<HashMap<i64, u32>>, key: i64) -> bool {
        let mut map = map.lock().unwrap();
        match map.get_mut(&key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    async fn perform(&self, key: i64, chat: ChatId, call: Call) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push((Instant::now(), call.clone()));
        self.marks.lock().unwrap().push(Mark::Started(key));

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let copy_fails = match &call {
            Call::Copy { message_id, .. } => Self::take_failure(&self.copy_failures, i64::from(*message_id)),
            _ => false,
        };
        let chat_fails = Self::take_failure(&self.chat_failures, chat);

        self.marks.lock().unwrap().push(Mark::Finished(key));
        if copy_fails || chat_fails {
            return Err(TransportError::new(format!("scripted failure for {:?}", call)));
        }
        Ok(())
    }

    fn one(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Transport for MockTransport {
    fn copy_message(&self, to: ChatId, from: ChatId, message_id: MessageId) -> BoxFuture<'_, MessageId> {
        Box::pin(async move {
            self.perform(i64::from(message_id), to, Call::Copy { to, from, message_id })
                .await?;
            Ok(self.one())
        })
    }

    fn send_location(&self, to: ChatId, _location: Location) -> BoxFuture<'_, MessageId> {
        Box::pin(async move {
            self.perform(to, to, Call::Location { to }).await?;
            Ok(self.one())
        })
    }

    fn send_contact(&self, to: ChatId, _contact: Contact) -> BoxFuture<'_, MessageId> {
        Box::pin(async move {
            self.perform(to, to, Call::Contact { to }).await?;
            Ok(self.one())
        })
    }

    fn send_poll(&self, to: ChatId, poll: Poll) -> BoxFuture<'_, MessageId> {
        Box::pin(async move {
            self.perform(
                to,
                to,
                Call::Poll {
                    to,
                    question: poll.question,
                },
            )
            .await?;
            Ok(self.one())
        })
    }

    fn send_media_group(&self, to: ChatId, items: Vec<MediaItem>) -> BoxFuture<'_, Vec<MessageId>> {
        Box::pin(async move {
            let count = items.len();
            self.perform(to, to, Call::MediaGroup { to, items }).await?;
            Ok((0..count).map(|_| self.one()).collect())
        })
    }

    fn edit_text(&self, chat: ChatId, message_id: MessageId, text: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.perform(
                chat,
                chat,
                Call::EditText {
                    chat,
                    message_id,
                    text,
                },
            )
            .await
        })
    }

    fn edit_caption(&self, chat: ChatId, message_id: MessageId, caption: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.perform(
                chat,
                chat,
                Call::EditCaption {
                    chat,
                    message_id,
                    caption,
                },
            )
            .await
        })
    }
}
