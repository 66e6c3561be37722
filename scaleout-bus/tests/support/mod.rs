//! Shared helpers for the scaleout bus integration tests.

#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use scaleout_bus::{
    BusConfig, Continuation, Delivery, Message, MessageId, ScaleoutBus, StreamCapacity,
    StreamCount, StreamIndex, Subscriber, SubscriberId, SubscriberInfo, SubscriberResult,
    Timestamp, TopicKey,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds a bus with `streams` streams retaining `capacity` batches each.
pub fn bus(streams: usize, capacity: usize) -> ScaleoutBus {
    let config = BusConfig::default()
        .with_stream_count(StreamCount::try_new(streams).expect("valid stream count"))
        .with_stream_capacity(StreamCapacity::try_new(capacity).expect("valid capacity"));
    ScaleoutBus::new(config)
}

pub fn key(name: &str) -> TopicKey {
    TopicKey::try_new(name).expect("valid topic key")
}

pub fn subscriber_for(keys: &[&str]) -> SubscriberInfo {
    SubscriberInfo::new(SubscriberId::generate(), keys.iter().map(|k| key(k)))
}

/// Midnight of the given day in January 2024.
pub fn day(n: u32) -> Timestamp {
    Timestamp::new(
        Utc.with_ymd_and_hms(2024, 1, n, 0, 0, 0)
            .single()
            .expect("valid date"),
    )
}

/// Publishes one batch whose messages all carry `key_name`.
pub fn publish(
    bus: &ScaleoutBus,
    stream: usize,
    id: u64,
    key_name: &str,
    values: &[&str],
    at: Timestamp,
) {
    let messages = values
        .iter()
        .map(|value| Message::new("test", key(key_name), *value))
        .collect();
    bus.publish(StreamIndex::new(stream), MessageId::new(id), messages, at)
        .expect("publish should succeed");
}

/// Forwards every delivery to a channel and keeps going.
pub struct Collector {
    tx: UnboundedSender<Delivery>,
}

impl Collector {
    pub fn new() -> (Self, UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Subscriber for Collector {
    async fn on_delivery(&mut self, delivery: Delivery) -> SubscriberResult<Continuation> {
        let _ = self.tx.send(delivery);
        Ok(Continuation::Continue)
    }
}

pub async fn next_delivery(rx: &mut UnboundedReceiver<Delivery>) -> Delivery {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("delivery should arrive in time")
        .expect("subscription should still be delivering")
}

/// Receives deliveries until `count` messages arrived.
pub async fn collect_messages(
    rx: &mut UnboundedReceiver<Delivery>,
    count: usize,
) -> Vec<Delivery> {
    let mut deliveries = Vec::new();
    let mut seen = 0;
    while seen < count {
        let delivery = next_delivery(rx).await;
        seen += delivery.messages.len();
        deliveries.push(delivery);
    }
    deliveries
}

pub fn values(deliveries: &[Delivery]) -> Vec<String> {
    deliveries
        .iter()
        .flat_map(|delivery| delivery.messages.iter())
        .map(|message| {
            message
                .message()
                .value
                .as_text()
                .expect("text payload")
                .to_owned()
        })
        .collect()
}

/// Asserts nothing else is delivered within a short grace period.
pub async fn assert_quiet(rx: &mut UnboundedReceiver<Delivery>) {
    let extra = timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(
        !matches!(extra, Ok(Some(_))),
        "no further delivery expected, got {extra:?}"
    );
}
