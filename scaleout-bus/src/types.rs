//! Core types for the scaleout message bus.
//!
//! Identifiers and keys use smart constructors so that a value which made it
//! into the bus is always valid - no further validation needed downstream.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Index of a stream (a horizontal shard of the backend) within a bus.
///
/// The range of valid indices is fixed when the bus is constructed; the bus
/// rejects indices outside of it.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    From,
    Serialize,
    Deserialize
))]
pub struct StreamIndex(usize);

/// Per-stream sequence id of a published batch.
///
/// Ids are assigned by whatever feeds the bus and must increase strictly
/// within a stream. Gaps are allowed.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    From,
    Serialize,
    Deserialize
))]
pub struct MessageId(u64);

impl MessageId {
    /// The id every stream starts before (nothing published yet).
    pub fn initial() -> Self {
        Self::new(0)
    }

    /// Returns the id immediately preceding this one, saturating at zero.
    #[must_use]
    pub fn previous(self) -> Self {
        Self::new(self.into_inner().saturating_sub(1))
    }
}

/// A topic key used to route messages to interested subscribers.
///
/// `TopicKey` values are trimmed, non-empty and at most 255 characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct TopicKey(String);

/// Identity of a subscriber (typically one client connection).
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Generates a fresh, time ordered subscriber id.
    pub fn generate() -> Self {
        Self::try_new(Uuid::now_v7().to_string())
            .expect("a formatted UUID is never empty nor longer than 255 chars")
    }
}

/// A timestamp for when a batch was created by its producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Payload carried by a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageValue {
    /// UTF-8 text payload.
    Text(String),
    /// Opaque binary payload.
    Bytes(Vec<u8>),
}

impl MessageValue {
    /// Returns the payload as text if it is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Bytes(_) => None,
        }
    }

    /// Returns the raw bytes of the payload.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }
}

impl From<&str> for MessageValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for MessageValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for MessageValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// A single published message. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced the message (e.g. a connection or server id).
    pub source: String,
    /// Routing key; only subscribers filtering on this key receive it.
    pub key: TopicKey,
    /// The payload.
    pub value: MessageValue,
}

impl Message {
    /// Creates a new message.
    pub fn new(source: impl Into<String>, key: TopicKey, value: impl Into<MessageValue>) -> Self {
        Self {
            source: source.into(),
            key,
            value: value.into(),
        }
    }
}

/// The payload of one publish call; the unit of storage and eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBatch {
    /// Stream the batch was published on.
    pub stream: StreamIndex,
    /// Sequence id of the batch within its stream.
    pub id: MessageId,
    /// Messages in publish order.
    pub messages: Vec<Message>,
    /// When the producer created the batch.
    pub creation_time: Timestamp,
}

impl MessageBatch {
    /// Creates a new batch.
    pub const fn new(
        stream: StreamIndex,
        id: MessageId,
        messages: Vec<Message>,
        creation_time: Timestamp,
    ) -> Self {
        Self {
            stream,
            id,
            messages,
            creation_time,
        }
    }
}

/// A message handed to a subscriber, together with where it came from.
///
/// Shares the stored batch instead of copying the message.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    batch: Arc<MessageBatch>,
    index: usize,
}

impl DeliveredMessage {
    pub(crate) fn new(batch: Arc<MessageBatch>, index: usize) -> Self {
        debug_assert!(index < batch.messages.len());
        Self { batch, index }
    }

    /// The delivered message.
    pub fn message(&self) -> &Message {
        &self.batch.messages[self.index]
    }

    /// Stream the message was published on.
    pub fn stream(&self) -> StreamIndex {
        self.batch.stream
    }

    /// Id of the batch that carried the message.
    pub fn id(&self) -> MessageId {
        self.batch.id
    }

    /// Creation time of the carrying batch.
    pub fn creation_time(&self) -> Timestamp {
        self.batch.creation_time
    }

    /// Position of the message inside its batch.
    pub const fn position(&self) -> usize {
        self.index
    }
}

impl PartialEq for DeliveredMessage {
    fn eq(&self, other: &Self) -> bool {
        self.stream() == other.stream()
            && self.id() == other.id()
            && self.index == other.index
            && self.message() == other.message()
    }
}

impl Eq for DeliveredMessage {}
