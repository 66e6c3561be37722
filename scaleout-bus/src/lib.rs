//! `scaleout-bus` - cursor-addressable multi-stream message bus
//!
//! Messages are published in batches onto independent streams (the shards
//! of a scaled-out backend). Every stream keeps a bounded backlog. A
//! subscriber spans all streams, filters by topic key and tracks its own
//! resume position as a [`Cursor`] whose text form survives reconnects.
//! Deliveries are merged across streams by creation time, bounded in size
//! and paced by the subscriber's own [`Continuation`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bus;
pub mod config;
pub mod cursor;
mod dispatcher;
pub mod errors;
pub mod store;
pub mod subscription;
pub mod types;

pub use bus::ScaleoutBus;
pub use config::{BusConfig, MaxMessages, StreamCapacity, StreamCount};
pub use cursor::{Cursor, CursorMode};
pub use errors::{BusError, BusResult, CursorError, SubscriberError, SubscriberResult};
pub use store::{StoreRead, StreamStats, StreamStore};
pub use subscription::{
    subscriber_fn, Continuation, Delivery, FnSubscriber, Subscriber, SubscriberInfo,
    SubscriptionHandle, SubscriptionId, Termination,
};
pub use types::{
    DeliveredMessage, Message, MessageBatch, MessageId, MessageValue, StreamIndex, SubscriberId,
    Timestamp, TopicKey,
};
