//! Subscriptions: what a subscriber implements and what it gets back.
//!
//! A subscriber is invoked with a [`Delivery`] and answers with a
//! [`Continuation`]. The bus never invokes the same subscription twice at
//! once; the next delivery is only prepared after the previous call returned
//! `Continue`, which lets a transport push data exactly as fast as its client
//! drains it.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::{self, JoinHandle};
use tracing::{debug, instrument};

use crate::bus::BusShared;
use crate::cursor::Cursor;
use crate::errors::{SubscriberError, SubscriberResult};
use crate::types::{DeliveredMessage, StreamIndex, SubscriberId, TopicKey};

/// Process-unique id of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What a subscriber wants after handling a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Keep delivering.
    Continue,
    /// End the subscription; no further deliveries.
    Stop,
}

/// One invocation's worth of messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Messages in delivery order, at most `max_messages` of them.
    pub messages: Vec<DeliveredMessage>,
    /// Resume cursor after this delivery; encode it with `to_string()`.
    pub cursor: Cursor,
    /// Some stream evicted messages this subscriber had not seen yet.
    pub overrun: bool,
    /// The streams that overran.
    pub overrun_streams: Vec<StreamIndex>,
    /// More messages are pending and will follow immediately.
    pub has_more: bool,
    /// Last delivery; the bus is shutting down.
    pub terminal: bool,
}

/// Receives deliveries for one subscription.
///
/// The implementor is the subscription's state: it is borrowed mutably for
/// each call and never shared between two calls in flight.
#[async_trait]
pub trait Subscriber: Send + 'static {
    /// Handles a delivery. Returning `Err` (or panicking) ends the
    /// subscription, the fault is reported through the handle.
    async fn on_delivery(&mut self, delivery: Delivery) -> SubscriberResult<Continuation>;
}

/// A subscriber built from a state value and a closure over it.
pub struct FnSubscriber<S, F> {
    state: S,
    callback: F,
}

/// Builds a [`Subscriber`] from `(delivery, &mut state) -> continuation`.
pub const fn subscriber_fn<S, F>(state: S, callback: F) -> FnSubscriber<S, F>
where
    S: Send + 'static,
    F: FnMut(Delivery, &mut S) -> SubscriberResult<Continuation> + Send + 'static,
{
    FnSubscriber { state, callback }
}

impl<S, F> FnSubscriber<S, F> {
    /// The state the callback has been folding deliveries into.
    pub const fn state(&self) -> &S {
        &self.state
    }
}

#[async_trait]
impl<S, F> Subscriber for FnSubscriber<S, F>
where
    S: Send + 'static,
    F: FnMut(Delivery, &mut S) -> SubscriberResult<Continuation> + Send + 'static,
{
    async fn on_delivery(&mut self, delivery: Delivery) -> SubscriberResult<Continuation> {
        (self.callback)(delivery, &mut self.state)
    }
}

/// Who is subscribing and which keys they care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    /// Subscriber identity, used for logging.
    pub id: SubscriberId,
    /// Keys whose messages are delivered.
    pub keys: HashSet<TopicKey>,
}

impl SubscriberInfo {
    /// Creates subscriber information.
    pub fn new(id: SubscriberId, keys: impl IntoIterator<Item = TopicKey>) -> Self {
        Self {
            id,
            keys: keys.into_iter().collect(),
        }
    }
}

/// Why a subscription ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The handle was disposed.
    Disposed,
    /// The subscriber returned [`Continuation::Stop`].
    Stopped,
    /// The subscriber failed or panicked.
    Faulted(SubscriberError),
    /// The bus was shut down.
    ShutDown,
}

/// State shared between a handle, its dispatcher task and the bus.
pub(crate) struct SubscriptionShared {
    pub(crate) id: SubscriptionId,
    pub(crate) subscriber: SubscriberId,
    pub(crate) keys: RwLock<HashSet<TopicKey>>,
    pub(crate) waker: Arc<Notify>,
    // Held for the whole of a wake; dispose takes it to wait out a callback.
    pub(crate) invocation: Mutex<()>,
    live: AtomicBool,
    cursor: SyncMutex<Cursor>,
    termination: watch::Sender<Option<Termination>>,
    task: SyncMutex<Option<JoinHandle<()>>>,
    task_id: OnceLock<task::Id>,
}

impl SubscriptionShared {
    pub(crate) fn new(id: SubscriptionId, info: SubscriberInfo, cursor: Cursor) -> Self {
        let (termination, _) = watch::channel(None);
        Self {
            id,
            subscriber: info.id,
            keys: RwLock::new(info.keys),
            waker: Arc::new(Notify::new()),
            invocation: Mutex::new(()),
            live: AtomicBool::new(true),
            cursor: SyncMutex::new(cursor),
            termination,
            task: SyncMutex::new(None),
            task_id: OnceLock::new(),
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.live.store(false, Ordering::Release);
    }

    pub(crate) fn set_cursor(&self, cursor: Cursor) {
        *self.cursor.lock() = cursor;
    }

    pub(crate) fn cursor(&self) -> Cursor {
        self.cursor.lock().clone()
    }

    /// Records why the subscription ended; the first reason wins.
    pub(crate) fn terminate(&self, reason: Termination) {
        self.termination.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn termination(&self) -> Option<Termination> {
        self.termination.borrow().clone()
    }

    pub(crate) fn set_task(&self, task: JoinHandle<()>) {
        *self.task.lock() = Some(task);
    }

    /// Remembers the dispatcher task; called by that task before its first
    /// wake.
    pub(crate) fn record_dispatcher_task(&self) {
        if let Some(id) = task::try_id() {
            let _ = self.task_id.set(id);
        }
    }

    /// Whether the caller runs on this subscription's own dispatcher task,
    /// i.e. from inside the subscriber.
    fn on_dispatcher_task(&self) -> bool {
        task::try_id().is_some_and(|current| self.task_id.get() == Some(&current))
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }

    async fn closed(&self) -> Termination {
        let mut rx = self.termination.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| reason.clone())
            .unwrap_or(Termination::Disposed)
    }
}

/// Owner's side of a subscription.
///
/// [`dispose`](Self::dispose) is the cancellation path. Dropping the handle
/// also ends the subscription, but cannot wait for a callback already in
/// flight.
pub struct SubscriptionHandle {
    shared: Arc<SubscriptionShared>,
    bus: Arc<BusShared>,
    disposed: bool,
}

impl SubscriptionHandle {
    pub(crate) const fn new(shared: Arc<SubscriptionShared>, bus: Arc<BusShared>) -> Self {
        Self {
            shared,
            bus,
            disposed: false,
        }
    }

    /// Id of the subscription.
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    /// Whether deliveries may still happen.
    pub fn is_live(&self) -> bool {
        self.shared.is_live()
    }

    /// Snapshot of the resume cursor as of the last delivery.
    pub fn cursor(&self) -> Cursor {
        self.shared.cursor()
    }

    /// Why the subscription ended, if it has.
    pub fn termination(&self) -> Option<Termination> {
        self.shared.termination()
    }

    /// Waits until the subscription ends and reports why.
    pub async fn closed(&self) -> Termination {
        self.shared.closed().await
    }

    /// Starts delivering messages with `key`. Retained messages past the
    /// cursor are considered on the next wake, which is scheduled now.
    pub fn add_key(&self, key: TopicKey) -> bool {
        let added = self.shared.keys.write().insert(key);
        if added {
            self.shared.waker.notify_one();
        }
        added
    }

    /// Stops delivering messages with `key`.
    pub fn remove_key(&self, key: &TopicKey) -> bool {
        self.shared.keys.write().remove(key)
    }

    /// Ends the subscription and reports why it ended.
    ///
    /// Waits for a callback already in flight; once this returns the
    /// subscriber is never invoked again. A fault raised by that callback
    /// is reported instead of [`Termination::Disposed`].
    ///
    /// May also be awaited from inside the subscriber: the current call
    /// then is the last one and nothing is waited for.
    #[instrument(skip(self), fields(subscription = %self.shared.id, subscriber = %self.shared.subscriber))]
    pub async fn dispose(mut self) -> Termination {
        self.disposed = true;
        self.shared.mark_dead();

        if self.shared.on_dispatcher_task() {
            // the invocation lock is held by our own caller
            self.shared.terminate(Termination::Disposed);
            self.bus.detach(&self.shared);
            self.shared.waker.notify_one();
            debug!("subscription disposed from its own callback");
            return self.reason();
        }

        // wait out a wake in progress; later wakes observe the dead flag
        let invocation = self.shared.invocation.lock().await;
        self.shared.terminate(Termination::Disposed);
        drop(invocation);

        self.bus.detach(&self.shared);
        self.shared.waker.notify_one();
        if let Some(task) = self.shared.take_task() {
            if let Err(err) = task.await {
                debug!(error = %err, "dispatcher task ended abnormally");
            }
        }
        debug!("subscription disposed");
        self.reason()
    }

    fn reason(&self) -> Termination {
        self.shared.termination().unwrap_or(Termination::Disposed)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.disposed {
            self.shared.terminate(Termination::Disposed);
            self.shared.mark_dead();
            self.bus.detach(&self.shared);
            self.shared.waker.notify_one();
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.shared.id)
            .field("subscriber", &self.shared.subscriber)
            .field("live", &self.shared.is_live())
            .finish_non_exhaustive()
    }
}
