//! Bounded per-stream backlog.
//!
//! Each stream owns a fixed-size ring of batches. Slots are addressed by the
//! store's own append sequence modulo the capacity, so batch ids may have
//! gaps; `min_id`/`max_id` are tracked explicitly and lookups by id binary
//! search the retained window. Eviction is O(1): appending to a full ring
//! overwrites the oldest slot.
//!
//! The store also keeps the set of subscriptions to wake when the stream
//! receives a batch. Both pieces of state are guarded by the store's own
//! locks; nothing here is shared across streams.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::trace;

use crate::config::StreamCapacity;
use crate::errors::{BusError, BusResult};
use crate::subscription::SubscriptionId;
use crate::types::{MessageBatch, MessageId, StreamIndex};

/// Result of reading a store from some position.
#[derive(Debug, Clone, Default)]
pub struct StoreRead {
    /// Retained batches newer than the requested position, ascending by id.
    pub batches: Vec<Arc<MessageBatch>>,
    /// The requested position has been evicted; some batches were lost.
    pub overrun: bool,
}

/// Point-in-time view of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    /// The stream described.
    pub stream: StreamIndex,
    /// Oldest retained id, `None` while the store is empty.
    pub min_id: Option<MessageId>,
    /// Newest id ever appended (0 when nothing was appended).
    pub max_id: MessageId,
    /// Batches currently retained.
    pub len: usize,
    /// Maximum batches retained.
    pub capacity: usize,
    /// Subscriptions registered for wake-ups.
    pub subscribers: usize,
}

struct Ring {
    slots: Vec<Option<Arc<MessageBatch>>>,
    // Append sequence of the next batch; the oldest retained batch is at
    // `next_seq - len`.
    next_seq: u64,
    len: usize,
    max_id: MessageId,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            next_seq: 0,
            len: 0,
            max_id: MessageId::initial(),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot_of(&self, seq: u64) -> usize {
        // capacity is at most 1_000_000, the remainder fits a usize
        (seq % self.capacity() as u64) as usize
    }

    /// The `n`-th retained batch, oldest first.
    fn nth(&self, n: usize) -> &Arc<MessageBatch> {
        debug_assert!(n < self.len);
        let oldest = self.next_seq - self.len as u64;
        self.slots[self.slot_of(oldest + n as u64)]
            .as_ref()
            .expect("retained slots are always occupied")
    }

    fn min_id(&self) -> Option<MessageId> {
        (self.len > 0).then(|| self.nth(0).id)
    }

    fn push(&mut self, batch: Arc<MessageBatch>) -> Option<Arc<MessageBatch>> {
        let slot = self.slot_of(self.next_seq);
        self.max_id = batch.id;
        self.next_seq += 1;
        let evicted = self.slots[slot].replace(batch);
        if evicted.is_none() {
            self.len += 1;
        }
        evicted
    }

    /// Index of the first retained batch with an id greater than `since`.
    fn first_after(&self, since: MessageId) -> usize {
        let (mut lo, mut hi) = (0, self.len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.nth(mid).id <= since {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

/// Fixed-capacity backlog of one stream plus its wake-up registry.
pub struct StreamStore {
    stream: StreamIndex,
    ring: RwLock<Ring>,
    subscribers: RwLock<HashMap<SubscriptionId, Arc<Notify>>>,
}

impl StreamStore {
    /// Creates an empty store retaining at most `capacity` batches.
    pub fn new(stream: StreamIndex, capacity: StreamCapacity) -> Self {
        Self {
            stream,
            ring: RwLock::new(Ring::new(capacity.into_inner())),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// The stream this store holds.
    pub const fn stream(&self) -> StreamIndex {
        self.stream
    }

    /// Appends a batch, evicting the oldest one when the ring is full.
    ///
    /// Returns the id of the evicted batch, if any. A batch whose id does
    /// not exceed the current max id is rejected and the store is unchanged.
    pub fn append(&self, batch: MessageBatch) -> BusResult<Option<MessageId>> {
        debug_assert_eq!(batch.stream, self.stream);
        let mut ring = self.ring.write();
        if batch.id <= ring.max_id {
            return Err(BusError::NonMonotonicId {
                stream: self.stream,
                id: batch.id,
                max_id: ring.max_id,
            });
        }

        let id = batch.id;
        let evicted = ring.push(Arc::new(batch)).map(|old| old.id);
        trace!(stream = %self.stream, %id, evicted = ?evicted, "appended batch");
        Ok(evicted)
    }

    /// Returns every retained batch with an id greater than `since`.
    ///
    /// When `since` has already been evicted the read is flagged as an
    /// overrun but still yields everything retained. Position 0 means the
    /// reader has never seen this stream and is never an overrun.
    pub fn messages_since(&self, since: MessageId) -> StoreRead {
        let ring = self.ring.read();
        let Some(min_id) = ring.min_id() else {
            return StoreRead::default();
        };

        let overrun = since != MessageId::initial() && since < min_id.previous();
        let batches = (ring.first_after(since)..ring.len)
            .map(|n| Arc::clone(ring.nth(n)))
            .collect();

        StoreRead { batches, overrun }
    }

    /// Smallest retained id, `None` while empty.
    pub fn min_id(&self) -> Option<MessageId> {
        self.ring.read().min_id()
    }

    /// Largest id ever appended.
    pub fn max_id(&self) -> MessageId {
        self.ring.read().max_id
    }

    /// Number of retained batches.
    pub fn len(&self) -> usize {
        self.ring.read().len
    }

    /// Whether no batch is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of retained batches.
    pub fn capacity(&self) -> usize {
        self.ring.read().capacity()
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> StreamStats {
        let (min_id, max_id, len, capacity) = {
            let ring = self.ring.read();
            (ring.min_id(), ring.max_id, ring.len, ring.capacity())
        };
        StreamStats {
            stream: self.stream,
            min_id,
            max_id,
            len,
            capacity,
            subscribers: self.subscribers.read().len(),
        }
    }

    /// Registers a subscription to be woken on every append.
    ///
    /// Registering the same subscription twice is a bug in the bus.
    pub(crate) fn register(&self, id: SubscriptionId, waker: Arc<Notify>) {
        let previous = self.subscribers.write().insert(id, waker);
        assert!(
            previous.is_none(),
            "subscription {id} registered twice on stream {}",
            self.stream
        );
    }

    /// Removes a subscription from the wake-up set.
    pub(crate) fn unregister(&self, id: SubscriptionId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    /// Wakes every registered subscription. Never waits on them.
    pub(crate) fn notify_subscribers(&self) -> usize {
        let subscribers = self.subscribers.read();
        for waker in subscribers.values() {
            waker.notify_one();
        }
        subscribers.len()
    }
}

impl std::fmt::Debug for StreamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStore")
            .field("stats", &self.stats())
            .finish()
    }
}
