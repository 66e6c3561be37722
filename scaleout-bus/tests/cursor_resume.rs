//! Resuming subscriptions from cursor text.

mod support;

use scaleout_bus::{BusError, CursorError, Timestamp};
use support::{
    assert_quiet, bus, collect_messages, next_delivery, publish, subscriber_for, values, Collector,
};

#[tokio::test]
async fn default_cursor_gets_only_new_messages() {
    // Given: a message published before anyone subscribed
    let bus = bus(1, 16);
    publish(&bus, 0, 1, "key", &["badvalue"], Timestamp::now());

    // When: a subscriber asks for new messages only, then one more is published
    let (collector, mut rx) = Collector::new();
    let handle = bus
        .subscribe(subscriber_for(&["key"]), Some("d-0,0"), collector, 10)
        .expect("subscription should be created");
    publish(&bus, 0, 2, "key", &["value"], Timestamp::now());

    // Then: only the new message is delivered
    let delivery = next_delivery(&mut rx).await;
    assert_eq!(values(&[delivery]), ["value"]);
    assert_quiet(&mut rx).await;

    handle.dispose().await;
}

#[tokio::test]
async fn default_cursor_suppresses_backlog_of_unlisted_streams() {
    let bus = bus(2, 16);
    publish(&bus, 1, 1, "key", &["old"], Timestamp::now());

    let (collector, mut rx) = Collector::new();
    let handle = bus
        .subscribe(subscriber_for(&["key"]), Some("d-0,0"), collector, 10)
        .expect("subscription should be created");
    assert_eq!(handle.cursor().to_string(), "s-0,0|1,1");

    publish(&bus, 1, 2, "key", &["new"], Timestamp::now());
    let delivery = next_delivery(&mut rx).await;
    assert_eq!(values(&[delivery]), ["new"]);

    handle.dispose().await;
}

#[tokio::test]
async fn missing_streams_in_explicit_cursor_default_to_zero() {
    // Given: a two stream bus and a cursor listing only stream 0
    let bus = bus(2, 16);
    let (collector, mut rx) = Collector::new();
    let handle = bus
        .subscribe(subscriber_for(&["key"]), Some("s-0,0"), collector, 10)
        .expect("subscription should be created");

    // When: stream 1 receives a message
    publish(&bus, 1, 1, "key", &["from stream 1"], Timestamp::now());

    // Then: it is delivered, and the cursor now names both streams
    let delivery = next_delivery(&mut rx).await;
    assert_eq!(values(&[delivery.clone()]), ["from stream 1"]);
    assert_eq!(delivery.cursor.to_string(), "s-0,0|1,1");

    handle.dispose().await;
}

#[tokio::test]
async fn absent_cursor_delivers_full_retained_backlog() {
    let bus = bus(1, 16);
    for id in 1..=3_u64 {
        publish(&bus, 0, id, "key", &[&id.to_string()], Timestamp::now());
    }

    let (collector, mut rx) = Collector::new();
    let handle = bus
        .subscribe(subscriber_for(&["key"]), None, collector, 10)
        .expect("subscription should be created");

    let deliveries = collect_messages(&mut rx, 3).await;
    assert_eq!(values(&deliveries), ["1", "2", "3"]);

    handle.dispose().await;
}

#[tokio::test]
async fn reconnect_with_delivered_cursor_resumes_without_gaps_or_repeats() {
    // Given: a first connection that saw five messages
    let bus = bus(2, 64);
    let (collector, mut rx) = Collector::new();
    let first = bus
        .subscribe(subscriber_for(&["key"]), None, collector, 10)
        .expect("subscription should be created");
    for id in 1..=5_u64 {
        publish(&bus, usize::from(id % 2 == 0), id, "key", &[&id.to_string()], Timestamp::now());
    }
    let deliveries = collect_messages(&mut rx, 5).await;
    let cursor = deliveries
        .last()
        .expect("at least one delivery")
        .cursor
        .to_string();
    first.dispose().await;

    // When: more is published while disconnected and the client reconnects
    for id in 6..=8_u64 {
        publish(&bus, usize::from(id % 2 == 0), id, "key", &[&id.to_string()], Timestamp::now());
    }
    let (collector, mut rx) = Collector::new();
    let second = bus
        .subscribe(subscriber_for(&["key"]), Some(&cursor), collector, 10)
        .expect("resubscription should be created");

    // Then: exactly the missed messages arrive
    let deliveries = collect_messages(&mut rx, 3).await;
    let mut missed = values(&deliveries);
    missed.sort();
    assert_eq!(missed, ["6", "7", "8"]);
    assert_quiet(&mut rx).await;

    second.dispose().await;
}

#[tokio::test]
async fn garbled_cursor_is_rejected_not_replaced() {
    let bus = bus(1, 16);
    let (collector, _rx) = Collector::new();

    let result = bus.subscribe(subscriber_for(&["key"]), Some("s-0;0"), collector, 10);

    assert!(matches!(
        result,
        Err(BusError::Cursor(CursorError::MalformedEntry(_)))
    ));
}
