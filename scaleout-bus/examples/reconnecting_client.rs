//! A client that reads part of the backlog, disconnects and resumes.
//!
//! Publishes random batches onto four streams, subscribes with the first
//! connection, keeps the last cursor it was handed and reconnects with it.
//! Set `RUST_LOG=scaleout_bus=debug` to watch the dispatcher.

use std::sync::{Arc, Mutex};

use rand::Rng;
use scaleout_bus::{
    BusConfig, Continuation, Message, MessageId, ScaleoutBus, StreamCount, StreamIndex,
    SubscriberId, SubscriberInfo, Timestamp, TopicKey,
};
use tracing_subscriber::EnvFilter;

const STREAMS: usize = 4;

fn publish_round(
    bus: &ScaleoutBus,
    ids: &mut [u64; STREAMS],
    key: &TopicKey,
    round: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = rand::rng();
    for _ in 0..8 {
        let stream = rng.random_range(0..STREAMS);
        ids[stream] += 1;
        let messages = (0..rng.random_range(1..4))
            .map(|n| Message::new("example", key.clone(), format!("round {round} #{n}")))
            .collect();
        bus.publish(
            StreamIndex::new(stream),
            MessageId::new(ids[stream]),
            messages,
            Timestamp::now(),
        )?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let bus = ScaleoutBus::new(
        BusConfig::low_latency()?.with_stream_count(StreamCount::try_new(STREAMS)?),
    );
    let key = TopicKey::try_new("chat")?;
    let mut ids = [0_u64; STREAMS];
    publish_round(&bus, &mut ids, &key, 1)?;

    // first connection: take one delivery and remember its cursor
    let last_cursor = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&last_cursor);
    let info = SubscriberInfo::new(SubscriberId::generate(), [key.clone()]);
    let first = bus.subscribe_fn(info, None, 5, 0_usize, move |delivery, count| {
        *count += delivery.messages.len();
        println!("first connection got {} messages ({count} total)", delivery.messages.len());
        *seen.lock().map_err(|e| scaleout_bus::SubscriberError::failed(e.to_string()))? =
            Some(delivery.cursor.to_string());
        Ok(Continuation::Stop)
    })?;
    println!("first connection ended: {:?}", first.closed().await);

    publish_round(&bus, &mut ids, &key, 2)?;

    let cursor = last_cursor.lock().map_err(|e| e.to_string())?.clone();
    println!("reconnecting with cursor {cursor:?}");
    let info = SubscriberInfo::new(SubscriberId::generate(), [key]);
    let second = bus.subscribe_fn(info, cursor.as_deref(), 100, (), |delivery, _| {
        for message in &delivery.messages {
            println!(
                "stream {} id {} at {}: {:?}",
                message.stream(),
                message.id(),
                message.creation_time().as_datetime(),
                message.message().value.as_text()
            );
        }
        if delivery.terminal {
            println!("bus shutting down, final cursor {}", delivery.cursor);
        }
        Ok(Continuation::Continue)
    })?;

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    bus.shutdown().await;
    println!("second connection ended: {:?}", second.closed().await);
    Ok(())
}
