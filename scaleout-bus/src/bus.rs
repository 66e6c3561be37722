//! The bus façade: publish into streams, subscribe across all of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, instrument, Instrument};

use crate::config::{BusConfig, MaxMessages};
use crate::cursor::Cursor;
use crate::dispatcher::Dispatcher;
use crate::errors::{BusError, BusResult, SubscriberResult};
use crate::store::{StreamStats, StreamStore};
use crate::subscription::{
    subscriber_fn, Continuation, Delivery, Subscriber, SubscriberInfo, SubscriptionHandle,
    SubscriptionId, SubscriptionShared,
};
use crate::types::{Message, MessageBatch, MessageId, StreamIndex, Timestamp};

/// State shared by the bus, its handles and the dispatcher tasks.
pub(crate) struct BusShared {
    config: BusConfig,
    stores: Vec<StreamStore>,
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<SubscriptionShared>>>,
    shut_down: AtomicBool,
}

impl BusShared {
    pub(crate) fn stores(&self) -> &[StreamStore] {
        &self.stores
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn store(&self, stream: StreamIndex) -> BusResult<&StreamStore> {
        self.stores
            .get(stream.into_inner())
            .ok_or(BusError::InvalidStream {
                stream,
                stream_count: self.stores.len(),
            })
    }

    /// Removes a subscription from every stream and from the registry.
    /// Idempotent.
    pub(crate) fn detach(&self, subscription: &SubscriptionShared) {
        for store in &self.stores {
            store.unregister(subscription.id);
        }
        self.subscriptions.write().remove(&subscription.id);
    }

    fn attach(&self, subscription: &Arc<SubscriptionShared>) {
        let previous = self
            .subscriptions
            .write()
            .insert(subscription.id, Arc::clone(subscription));
        assert!(
            previous.is_none(),
            "duplicate subscription id {}",
            subscription.id
        );
        for store in &self.stores {
            store.register(subscription.id, Arc::clone(&subscription.waker));
        }
    }
}

/// A multi-stream pub/sub bus with a bounded backlog per stream.
///
/// Cloning the bus is cheap and yields another handle to the same streams
/// and subscriptions.
///
/// # Example
///
/// ```rust,ignore
/// let bus = ScaleoutBus::new(BusConfig::default());
/// let info = SubscriberInfo::new(SubscriberId::generate(), [key.clone()]);
/// let handle = bus.subscribe_fn(info, None, 100, Vec::new(), |delivery, seen| {
///     seen.extend(delivery.messages);
///     Ok(Continuation::Continue)
/// })?;
/// bus.publish(StreamIndex::new(0), MessageId::new(1), messages, Timestamp::now())?;
/// handle.dispose().await;
/// ```
#[derive(Clone)]
pub struct ScaleoutBus {
    shared: Arc<BusShared>,
}

impl ScaleoutBus {
    /// Creates a bus with one empty store per configured stream.
    pub fn new(config: BusConfig) -> Self {
        let stores = (0..config.streams())
            .map(|index| StreamStore::new(StreamIndex::new(index), config.stream_capacity))
            .collect();
        info!(
            streams = config.streams(),
            capacity = config.capacity(),
            "scaleout bus created"
        );
        Self {
            shared: Arc::new(BusShared {
                config,
                stores,
                subscriptions: RwLock::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// The configuration the bus was built with.
    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Number of streams.
    pub fn stream_count(&self) -> usize {
        self.shared.stores.len()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.read().len()
    }

    /// Statistics of one stream's store.
    pub fn stream_stats(&self, stream: StreamIndex) -> BusResult<StreamStats> {
        Ok(self.shared.store(stream)?.stats())
    }

    /// Appends a batch to `stream` and wakes every subscription on it.
    ///
    /// Never waits for subscribers; they are only scheduled.
    pub fn publish(
        &self,
        stream: StreamIndex,
        id: MessageId,
        messages: Vec<Message>,
        creation_time: Timestamp,
    ) -> BusResult<()> {
        if self.shared.is_shut_down() {
            return Err(BusError::ShutDown);
        }
        let store = self.shared.store(stream)?;
        let count = messages.len();
        let evicted = store.append(MessageBatch::new(stream, id, messages, creation_time))?;
        let woken = store.notify_subscribers();
        debug!(
            stream = %stream,
            id = %id,
            messages = count,
            evicted = ?evicted,
            woken,
            "published batch"
        );
        Ok(())
    }

    /// Subscribes across every stream of the bus.
    ///
    /// `cursor` is the text a previous delivery handed out (`None` or empty
    /// for the full retained backlog). Backlog matching the cursor is
    /// delivered right away without waiting for a publish. Must be called
    /// from within a tokio runtime.
    #[instrument(skip(self, info, subscriber), fields(subscriber = %info.id, keys = info.keys.len()))]
    pub fn subscribe<S>(
        &self,
        info: SubscriberInfo,
        cursor: Option<&str>,
        subscriber: S,
        max_messages: usize,
    ) -> BusResult<SubscriptionHandle>
    where
        S: Subscriber,
    {
        if self.shared.is_shut_down() {
            return Err(BusError::ShutDown);
        }
        let max_messages = MaxMessages::try_new(max_messages)
            .map_err(|_| BusError::InvalidMaxMessages)?
            .into_inner();
        let stores = &self.shared.stores;
        let cursor = Cursor::decode(cursor)?
            .expand(stores.len())?
            .resolve_floors(|stream| stores[stream.into_inner()].max_id());
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BusError::NoRuntime)?;

        let id = SubscriptionId::next();
        let shared = Arc::new(SubscriptionShared::new(id, info, cursor.clone()));
        self.shared.attach(&shared);
        if self.shared.is_shut_down() {
            // lost the race against shutdown
            self.shared.detach(&shared);
            return Err(BusError::ShutDown);
        }

        // first wake delivers retained backlog
        shared.waker.notify_one();
        let dispatcher = Dispatcher::new(
            Arc::clone(&shared),
            Arc::clone(&self.shared),
            Box::new(subscriber),
            cursor,
            max_messages,
        );
        shared.set_task(runtime.spawn(dispatcher.run().in_current_span()));

        debug!(subscription = %id, "subscribed");
        Ok(SubscriptionHandle::new(shared, Arc::clone(&self.shared)))
    }

    /// Like [`subscribe`](Self::subscribe), taking the configured default
    /// delivery size.
    pub fn subscribe_with_defaults<S>(
        &self,
        info: SubscriberInfo,
        cursor: Option<&str>,
        subscriber: S,
    ) -> BusResult<SubscriptionHandle>
    where
        S: Subscriber,
    {
        let max_messages = self.shared.config.default_max_messages.into_inner();
        self.subscribe(info, cursor, subscriber, max_messages)
    }

    /// Subscribes with a closure over `state`: `(delivery, &mut state) ->
    /// continuation`.
    pub fn subscribe_fn<T, F>(
        &self,
        info: SubscriberInfo,
        cursor: Option<&str>,
        max_messages: usize,
        state: T,
        callback: F,
    ) -> BusResult<SubscriptionHandle>
    where
        T: Send + 'static,
        F: FnMut(Delivery, &mut T) -> SubscriberResult<Continuation> + Send + 'static,
    {
        self.subscribe(info, cursor, subscriber_fn(state, callback), max_messages)
    }

    /// Stops the bus.
    ///
    /// Every live subscription receives a final delivery flagged `terminal`
    /// and then ends with [`Termination::ShutDown`](crate::Termination::ShutDown).
    /// Later publishes and subscribes fail with [`BusError::ShutDown`].
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let subscriptions: Vec<_> = self
            .shared
            .subscriptions
            .read()
            .values()
            .cloned()
            .collect();
        info!(subscriptions = subscriptions.len(), "shutting down scaleout bus");

        let tasks: Vec<_> = subscriptions
            .iter()
            .filter_map(|subscription| {
                subscription.waker.notify_one();
                subscription.take_task()
            })
            .collect();
        for outcome in futures::future::join_all(tasks).await {
            if let Err(err) = outcome {
                debug!(error = %err, "dispatcher task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for ScaleoutBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScaleoutBus")
            .field("config", &self.shared.config)
            .field("subscriptions", &self.subscription_count())
            .field("shut_down", &self.shared.is_shut_down())
            .finish()
    }
}
