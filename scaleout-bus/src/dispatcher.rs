//! Fan-in dispatcher: the per-subscription delivery loop.
//!
//! Each subscription runs one dispatcher task with the state machine
//! `Idle -> Waking -> (Idle | Dead)`. A wake reads every stream the
//! subscription spans from its cursor, keeps the messages whose key is in
//! the filter, merges the streams by creation time (ties by stream, then
//! id, then position in the batch) and hands at most `max_messages` of them
//! to the subscriber. Within a stream, id order is never violated: the merge
//! only ever takes the head of a stream's queue.
//!
//! Wakes are requested through the subscription's `Notify`. Requests made
//! while a wake is running collapse into a single stored permit, so a busy
//! stream never causes concurrent or queued-up invocations.

use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use crate::bus::BusShared;
use crate::cursor::Cursor;
use crate::errors::SubscriberError;
use crate::subscription::{
    Continuation, Delivery, Subscriber, SubscriptionShared, Termination,
};
use crate::types::{DeliveredMessage, MessageBatch, MessageId, StreamIndex, Timestamp, TopicKey};

/// Merge order of a candidate message.
type MergeKey = (Timestamp, StreamIndex, MessageId, usize);

/// What a single wake left behind.
#[derive(Debug, PartialEq, Eq)]
enum WakeOutcome {
    /// Nothing pending; wait for the next notification.
    Idle,
    /// Messages were held back by `max_messages`; wake again right away.
    MoreWork,
    /// The subscription is over.
    Finished(Termination),
}

/// A batch read from a stream together with the filter matches still owed.
struct StreamItem {
    batch: Arc<MessageBatch>,
    // positions of matching messages not yet delivered, in batch order
    pending: Vec<usize>,
    // batch position of the last message delivered by an earlier wake
    delivered_through: Option<usize>,
}

/// Everything one stream contributes to a wake.
struct StreamRead {
    stream: StreamIndex,
    items: Vec<StreamItem>,
    // cursor value to fall back to when nothing of the stream is consumed
    baseline: MessageId,
}

/// The messages chosen for one delivery plus the bookkeeping to commit them.
struct Selection {
    messages: Vec<DeliveredMessage>,
    overrun_streams: Vec<StreamIndex>,
    has_more: bool,
    advances: Vec<(StreamIndex, MessageId)>,
    partial: HashMap<StreamIndex, (MessageId, usize)>,
}

/// Drives deliveries for one subscription.
pub(crate) struct Dispatcher {
    shared: Arc<SubscriptionShared>,
    bus: Arc<BusShared>,
    subscriber: Box<dyn Subscriber>,
    cursor: Cursor,
    // Batches handed out only in part: batch id and the batch position of
    // the last message sent. Positions stay valid when the key filter
    // changes between wakes. Not encoded in the cursor, which stays at the
    // last whole batch.
    partial: HashMap<StreamIndex, (MessageId, usize)>,
    max_messages: usize,
}

impl Dispatcher {
    pub(crate) fn new(
        shared: Arc<SubscriptionShared>,
        bus: Arc<BusShared>,
        subscriber: Box<dyn Subscriber>,
        cursor: Cursor,
        max_messages: usize,
    ) -> Self {
        Self {
            shared,
            bus,
            subscriber,
            cursor,
            partial: HashMap::new(),
            max_messages,
        }
    }

    /// Runs until the subscription ends. The first wake must already have
    /// been requested by whoever spawned the task.
    pub(crate) async fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        shared.record_dispatcher_task();
        let reason = 'idle: loop {
            shared.waker.notified().await;
            loop {
                match self.wake().await {
                    WakeOutcome::Idle => continue 'idle,
                    WakeOutcome::MoreWork => {}
                    WakeOutcome::Finished(reason) => break 'idle reason,
                }
            }
        };

        debug!(
            subscription = %shared.id,
            subscriber = %shared.subscriber,
            reason = ?shared.termination().unwrap_or(reason),
            "subscription ended"
        );
    }

    async fn wake(&mut self) -> WakeOutcome {
        let shared = Arc::clone(&self.shared);
        let _invocation = shared.invocation.lock().await;
        let outcome = self.wake_locked().await;
        // the reason must be recorded before the invocation lock is released
        if let WakeOutcome::Finished(reason) = &outcome {
            shared.mark_dead();
            self.bus.detach(&shared);
            shared.terminate(reason.clone());
        }
        outcome
    }

    async fn wake_locked(&mut self) -> WakeOutcome {
        let shared = Arc::clone(&self.shared);
        if !shared.is_live() {
            return WakeOutcome::Finished(Termination::Disposed);
        }

        if self.bus.is_shut_down() {
            let delivery = Delivery {
                messages: Vec::new(),
                cursor: self.cursor.clone(),
                overrun: false,
                overrun_streams: Vec::new(),
                has_more: false,
                terminal: true,
            };
            // the subscriber's answer cannot keep the subscription alive
            if let Err(err) = self.invoke(delivery).await {
                warn!(subscription = %shared.id, error = %err, "subscriber failed on terminal delivery");
            }
            return WakeOutcome::Finished(Termination::ShutDown);
        }

        let selection = {
            let keys = shared.keys.read();
            self.select(&keys)
        };
        let has_more = selection.has_more;
        let report = !selection.messages.is_empty() || !selection.overrun_streams.is_empty();
        let delivery = self.commit(selection);

        if !report {
            trace!(subscription = %shared.id, "wake found nothing to deliver");
            return if has_more {
                WakeOutcome::MoreWork
            } else {
                WakeOutcome::Idle
            };
        }

        debug!(
            subscription = %shared.id,
            delivered = delivery.messages.len(),
            overrun = delivery.overrun,
            has_more,
            "delivering"
        );
        match self.invoke(delivery).await {
            Ok(Continuation::Continue) if has_more => WakeOutcome::MoreWork,
            Ok(Continuation::Continue) => WakeOutcome::Idle,
            Ok(Continuation::Stop) => WakeOutcome::Finished(Termination::Stopped),
            Err(err) => {
                error!(
                    subscription = %shared.id,
                    subscriber = %shared.subscriber,
                    error = %err,
                    "subscriber faulted, ending subscription"
                );
                WakeOutcome::Finished(Termination::Faulted(err))
            }
        }
    }

    async fn invoke(&mut self, delivery: Delivery) -> Result<Continuation, SubscriberError> {
        AssertUnwindSafe(self.subscriber.on_delivery(delivery))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(SubscriberError::Panicked(panic_message(&*panic))))
    }

    /// Reads every stream and picks the next delivery. Pure with respect to
    /// the dispatcher state; [`commit`](Self::commit) applies the result.
    fn select(&self, keys: &HashSet<TopicKey>) -> Selection {
        let mut overrun_streams = Vec::new();
        let reads: Vec<StreamRead> = self
            .bus
            .stores()
            .iter()
            .map(|store| {
                let stream = store.stream();
                let since = self.cursor.position(stream).unwrap_or_else(MessageId::initial);
                let read = store.messages_since(since);

                let mut baseline = since;
                if read.overrun {
                    warn!(
                        subscription = %self.shared.id,
                        stream = %stream,
                        since = %since,
                        "buffer overrun, resuming from oldest retained batch"
                    );
                    overrun_streams.push(stream);
                    if let Some(first) = read.batches.first() {
                        baseline = first.id.previous();
                    }
                }

                let partial = self.partial.get(&stream).copied();
                let items = read
                    .batches
                    .into_iter()
                    .map(|batch| {
                        let delivered_through = match partial {
                            Some((id, last)) if id == batch.id => Some(last),
                            _ => None,
                        };
                        let pending = batch
                            .messages
                            .iter()
                            .enumerate()
                            .filter(|(position, message)| {
                                !matches!(delivered_through, Some(last) if *position <= last)
                                    && keys.contains(&message.key)
                            })
                            .map(|(position, _)| position)
                            .collect();
                        StreamItem {
                            batch,
                            pending,
                            delivered_through,
                        }
                    })
                    .collect();

                StreamRead {
                    stream,
                    items,
                    baseline,
                }
            })
            .collect();

        let (messages, taken) = merge(&reads, self.max_messages);

        let mut has_more = false;
        let mut advances = Vec::new();
        let mut partial = HashMap::new();
        for (read, taken) in reads.iter().zip(taken) {
            let (position, in_progress, left) = consumed_position(read, taken);
            has_more |= left;
            advances.push((read.stream, position));
            if let Some(in_progress) = in_progress {
                partial.insert(read.stream, in_progress);
            }
        }

        Selection {
            messages,
            overrun_streams,
            has_more,
            advances,
            partial,
        }
    }

    /// Applies a selection to the cursor and builds the delivery for it.
    fn commit(&mut self, selection: Selection) -> Delivery {
        for (stream, id) in selection.advances {
            self.cursor.advance(stream, id);
        }
        self.partial = selection.partial;
        self.shared.set_cursor(self.cursor.clone());

        Delivery {
            messages: selection.messages,
            cursor: self.cursor.clone(),
            overrun: !selection.overrun_streams.is_empty(),
            overrun_streams: selection.overrun_streams,
            has_more: selection.has_more,
            terminal: false,
        }
    }
}

/// K-way merge of the per-stream pending messages, taking at most `limit`.
///
/// Returns the merged messages and how many were taken from each stream.
fn merge(reads: &[StreamRead], limit: usize) -> (Vec<DeliveredMessage>, Vec<usize>) {
    let mut queues: Vec<VecDeque<(MergeKey, DeliveredMessage)>> = reads
        .iter()
        .map(|read| {
            read.items
                .iter()
                .flat_map(|item| {
                    item.pending.iter().map(|&position| {
                        let batch = &item.batch;
                        (
                            (batch.creation_time, batch.stream, batch.id, position),
                            DeliveredMessage::new(Arc::clone(batch), position),
                        )
                    })
                })
                .collect()
        })
        .collect();

    let mut heads: BinaryHeap<Reverse<(MergeKey, usize)>> = queues
        .iter()
        .enumerate()
        .filter_map(|(queue, items)| items.front().map(|(key, _)| Reverse((*key, queue))))
        .collect();

    let mut taken = vec![0; reads.len()];
    let mut merged = Vec::new();
    while merged.len() < limit {
        let Some(Reverse((_, queue))) = heads.pop() else {
            break;
        };
        if let Some((_, message)) = queues[queue].pop_front() {
            merged.push(message);
            taken[queue] += 1;
        }
        if let Some((key, _)) = queues[queue].front() {
            heads.push(Reverse((*key, queue)));
        }
    }

    (merged, taken)
}

/// Where a stream's cursor lands after `taken` of its pending messages were
/// delivered.
///
/// Returns the last wholly consumed batch id, the batch left half delivered
/// with the position of its last delivered message (if any) and whether
/// messages remain pending.
fn consumed_position(
    read: &StreamRead,
    mut taken: usize,
) -> (MessageId, Option<(MessageId, usize)>, bool) {
    let mut position = read.baseline;
    for item in &read.items {
        let owed = item.pending.len();
        if taken >= owed {
            taken -= owed;
            position = item.batch.id;
            continue;
        }
        let last = taken
            .checked_sub(1)
            .map(|n| item.pending[n])
            .or(item.delivered_through);
        let partial = last.map(|last| (item.batch.id, last));
        return (position, partial, true);
    }
    (position, None, false)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}
