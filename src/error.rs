// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the channel replication pipeline.
//!
//! Errors are categorized by where they originate (transport, content,
//! configuration, mapping store) and classified as retryable or terminal.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Network errors, platform throttling, timeouts |
//! | `CircuitOpen` | Yes | Destination circuit breaker is open |
//! | `UnsupportedContent` | No | Content kind cannot be replicated |
//! | `EmptyBatch` | No | Sealed media group produced no valid items |
//! | `Config` | No | Missing, disabled, or invalid replication config |
//! | `MappingStore` | No | External mapping store failure |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Internal` | No | Unexpected internal error |
//!
//! Dedup and rate-limit skips are not errors. They are reported through
//! [`Outcome`](crate::engine::Outcome) values.
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether a failed
//! replication attempt goes back through the
//! [`RetryPolicy`](crate::resilience::RetryPolicy).

use crate::transport::TransportError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while replicating content.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// Transport call failed (network, platform throttling).
    ///
    /// Retryable with exponential backoff up to the attempt ceiling.
    #[error("Transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        retry_after: Option<std::time::Duration>,
    },

    /// The destination's circuit breaker rejected the call.
    #[error("Circuit open for destination {destination}")]
    CircuitOpen { destination: i64 },

    /// Content kind has no outbound mapping.
    #[error("Unsupported content kind: {0}")]
    UnsupportedContent(String),

    /// A sealed media group had no members that map to album items.
    #[error("Media group {group_id} produced no valid items")]
    EmptyBatch { group_id: String },

    /// Invalid or missing replication configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mapping store read or write failed.
    #[error("Mapping store error: {0}")]
    MappingStore(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error from a failed transport call.
    pub fn transport(operation: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.message,
            retry_after: source.retry_after,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::CircuitOpen { .. } => true,
            Self::UnsupportedContent(_) => false,
            Self::EmptyBatch { .. } => false,
            Self::Config(_) => false,
            Self::MappingStore(_) => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label used for metrics and action log context.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::UnsupportedContent(_) => "unsupported_content",
            Self::EmptyBatch { .. } => "empty_batch",
            Self::Config(_) => "config",
            Self::MappingStore(_) => "mapping_store",
            Self::InvalidState { .. } => "invalid_state",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this failure says something about the destination's health.
    ///
    /// Content and bookkeeping errors do not trip a destination breaker.
    pub fn is_destination_fault(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Platform-suggested wait before retrying, if any.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::Transport { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
