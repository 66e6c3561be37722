//! Bounded retention and overrun reporting.

mod support;

use scaleout_bus::{MessageId, StreamIndex, Timestamp};
use support::{assert_quiet, bus, collect_messages, next_delivery, publish, subscriber_for, values, Collector};

#[tokio::test]
async fn overrun_is_contained_to_the_stream_that_evicted() {
    // Given: stream 0 evicted far past the cursor, stream 1 did not
    let bus = bus(2, 3);
    for id in 1..=10_u64 {
        publish(&bus, 0, id, "key", &[&format!("a{id}")], Timestamp::now());
    }
    for id in 1..=3_u64 {
        publish(&bus, 1, id, "key", &[&format!("b{id}")], Timestamp::now());
    }

    // When: a subscriber resumes from id 2 on both
    let (collector, mut rx) = Collector::new();
    let handle = bus
        .subscribe(subscriber_for(&["key"]), Some("s-0,2|1,2"), collector, 10)
        .expect("subscription should be created");

    // Then: only stream 0 is reported, and both deliver what they still retain
    let delivery = next_delivery(&mut rx).await;
    assert!(delivery.overrun);
    assert_eq!(delivery.overrun_streams, [StreamIndex::new(0)]);
    let mut delivered = values(&[delivery.clone()]);
    delivered.sort();
    assert_eq!(delivered, ["a10", "a8", "a9", "b3"]);
    assert_eq!(delivery.cursor.to_string(), "s-0,a|1,3");

    handle.dispose().await;
}

#[tokio::test]
async fn overrun_is_reported_once() {
    let bus = bus(1, 2);
    for id in 1..=5_u64 {
        publish(&bus, 0, id, "key", &[&id.to_string()], Timestamp::now());
    }

    let (collector, mut rx) = Collector::new();
    let handle = bus
        .subscribe(subscriber_for(&["key"]), Some("s-0,1"), collector, 10)
        .expect("subscription should be created");
    let first = next_delivery(&mut rx).await;
    assert!(first.overrun);
    assert_eq!(values(&[first]), ["4", "5"]);

    publish(&bus, 0, 6, "key", &["6"], Timestamp::now());
    let second = next_delivery(&mut rx).await;
    assert!(!second.overrun);
    assert!(second.overrun_streams.is_empty());
    assert_eq!(values(&[second]), ["6"]);

    handle.dispose().await;
}

#[tokio::test]
async fn overrun_without_matching_messages_is_still_reported() {
    // Given: evicted history and a retained backlog the subscriber filters out
    let bus = bus(1, 2);
    for id in 1..=4_u64 {
        publish(&bus, 0, id, "other", &["skip"], Timestamp::now());
    }

    // When
    let (collector, mut rx) = Collector::new();
    let handle = bus
        .subscribe(subscriber_for(&["key"]), Some("s-0,1"), collector, 10)
        .expect("subscription should be created");

    // Then: the subscriber learns about the loss with an empty delivery
    let delivery = next_delivery(&mut rx).await;
    assert!(delivery.overrun);
    assert!(delivery.messages.is_empty());
    assert_eq!(delivery.cursor.to_string(), "s-0,4");
    assert_quiet(&mut rx).await;

    handle.dispose().await;
}

#[tokio::test]
async fn never_subscribed_cursor_is_not_an_overrun() {
    let bus = bus(1, 2);
    for id in 1..=5_u64 {
        publish(&bus, 0, id, "key", &[&id.to_string()], Timestamp::now());
    }

    let (collector, mut rx) = Collector::new();
    let handle = bus
        .subscribe(subscriber_for(&["key"]), None, collector, 10)
        .expect("subscription should be created");

    let deliveries = collect_messages(&mut rx, 2).await;
    assert!(deliveries.iter().all(|d| !d.overrun));
    assert_eq!(values(&deliveries), ["4", "5"]);

    handle.dispose().await;
}

#[test]
fn retention_keeps_the_newest_batches() {
    let bus = bus(1, 3);
    for id in [2_u64, 5, 9, 12] {
        publish(&bus, 0, id, "key", &["v"], Timestamp::now());
    }

    let stats = bus
        .stream_stats(StreamIndex::new(0))
        .expect("stream exists");
    assert_eq!(stats.min_id, Some(MessageId::new(5)));
    assert_eq!(stats.max_id, MessageId::new(12));
    assert_eq!(stats.len, 3);
    assert_eq!(stats.capacity, 3);
}
