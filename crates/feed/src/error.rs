//! Feed error types

use crate::types::SequenceNumber;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the feed codec, server and client
#[derive(Debug, Error)]
pub enum FeedError {
    /// Frame was truncated, had trailing bytes, or did not decode
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Signature did not verify against the publisher key
    #[error("Invalid signature on message {sequence_number}")]
    SignatureInvalid { sequence_number: SequenceNumber },

    /// Publish called with a sequence number that does not follow the last one
    #[error("Sequence violation: expected {expected}, got {got}")]
    SequenceViolation {
        expected: SequenceNumber,
        got: SequenceNumber,
    },

    /// Client observed a forward gap in the stream
    #[error("Sequence gap: expected {expected}, got {got}")]
    SequenceGap {
        expected: SequenceNumber,
        got: SequenceNumber,
    },

    /// Requested resume point is no longer retained by the server
    #[error("Resync required: requested {requested}, oldest available {oldest_available:?}")]
    ResyncRequired {
        requested: SequenceNumber,
        oldest_available: Option<SequenceNumber>,
    },

    /// Connect retries exhausted
    #[error("Failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("Broadcast server already running")]
    AlreadyRunning,

    #[error("Broadcast server not running")]
    NotRunning,

    #[error("I/O timed out after {0:?}")]
    IoTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl FeedError {
    /// Whether this error is handled by reconnecting rather than surfacing
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            FeedError::ResyncRequired { .. }
                | FeedError::SequenceViolation { .. }
                | FeedError::AlreadyRunning
                | FeedError::NotRunning
        )
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
