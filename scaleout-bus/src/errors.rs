//! Error types for the scaleout message bus.
//!
//! - **`BusError`**: failures surfaced by the bus façade (`publish`, `subscribe`)
//! - **`CursorError`**: malformed cursor text
//! - **`SubscriberError`**: a subscriber fault raised while handling a delivery
//!
//! Buffer overrun is deliberately absent: it is reported through the
//! `overrun` flag of a delivery, never as an error.

use thiserror::Error;

use crate::types::{MessageId, StreamIndex};

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Result type returned by subscribers.
pub type SubscriberResult<T> = Result<T, SubscriberError>;

/// Errors surfaced by the bus façade.
///
/// # Error Handling Strategy
///
/// - **Cursor**: the client sent a garbled cursor; reject the connection
/// - **InvalidStream** / **InvalidMaxMessages**: programming error in the caller
/// - **NonMonotonicId**: the feed replayed or reordered a batch; drop it
/// - **NoRuntime**: `subscribe` was called outside of a tokio runtime
/// - **ShutDown**: the bus no longer accepts work
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Cursor text could not be decoded.
    #[error("Invalid cursor: {0}")]
    Cursor(#[from] CursorError),

    /// A stream index outside the configured range was used.
    #[error("Stream {stream} is out of range (bus has {stream_count} streams)")]
    InvalidStream {
        /// The offending stream index
        stream: StreamIndex,
        /// Number of streams the bus was built with
        stream_count: usize,
    },

    /// `max_messages` must be at least one.
    #[error("max_messages must be at least 1")]
    InvalidMaxMessages,

    /// A batch id did not increase strictly within its stream.
    #[error("Batch id {id} on stream {stream} is not greater than the current max id {max_id}")]
    NonMonotonicId {
        /// The stream the batch was published on
        stream: StreamIndex,
        /// The rejected id
        id: MessageId,
        /// The highest id the stream already holds
        max_id: MessageId,
    },

    /// No tokio runtime was available to drive the subscription.
    #[error("subscribe must be called from within a tokio runtime")]
    NoRuntime,

    /// The bus has been shut down.
    #[error("The bus has been shut down")]
    ShutDown,
}

/// Errors produced while decoding cursor text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    /// The text does not start with a known mode prefix followed by `-`.
    #[error("Missing or unknown cursor prefix in '{0}'")]
    InvalidPrefix(String),

    /// A `stream,id` pair could not be parsed.
    #[error("Malformed cursor entry '{0}'")]
    MalformedEntry(String),

    /// The same stream was listed twice.
    #[error("Stream {0} appears more than once in the cursor")]
    DuplicateStream(StreamIndex),
}

/// A fault raised by a subscriber while handling a delivery.
///
/// Any fault ends the subscription; the fault is reported through the
/// subscription handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriberError {
    /// The subscriber rejected the delivery.
    #[error("Subscriber failed: {0}")]
    Failed(String),

    /// The subscriber panicked.
    #[error("Subscriber panicked: {0}")]
    Panicked(String),
}

impl SubscriberError {
    /// Creates a failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
