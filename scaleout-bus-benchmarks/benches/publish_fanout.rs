use std::hint::black_box;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use scaleout_bus::{
    BusConfig, Continuation, Delivery, Message, MessageId, ScaleoutBus, StreamCapacity,
    StreamCount, StreamIndex, Subscriber, SubscriberId, SubscriberInfo, SubscriberResult,
    Timestamp, TopicKey,
};
use tokio::runtime::Runtime;
use tokio::sync::Notify;

fn bus(streams: usize) -> ScaleoutBus {
    ScaleoutBus::new(
        BusConfig::default()
            .with_stream_count(StreamCount::try_new(streams).unwrap())
            .with_stream_capacity(StreamCapacity::try_new(1_024).unwrap()),
    )
}

fn batch(key: &TopicKey, size: usize) -> Vec<Message> {
    (0..size)
        .map(|n| Message::new("bench", key.clone(), format!("payload {n}")))
        .collect()
}

/// Counts delivered messages and pings the benchmark loop.
struct Counting {
    received: Arc<AtomicUsize>,
    progress: Arc<Notify>,
}

#[async_trait]
impl Subscriber for Counting {
    async fn on_delivery(&mut self, delivery: Delivery) -> SubscriberResult<Continuation> {
        self.received
            .fetch_add(delivery.messages.len(), Ordering::Relaxed);
        self.progress.notify_one();
        Ok(Continuation::Continue)
    }
}

/// Benchmark publishing without subscribers
fn bench_publish(c: &mut Criterion) {
    let key = TopicKey::try_new("bench").unwrap();
    let mut group = c.benchmark_group("publish");

    for size in [1_usize, 10, 100] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("batch_size", size), &size, |b, &size| {
            let bus = bus(1);
            let next = AtomicU64::new(1);
            b.iter(|| {
                let id = MessageId::new(next.fetch_add(1, Ordering::Relaxed));
                black_box(bus.publish(
                    StreamIndex::new(0),
                    id,
                    batch(&key, size),
                    Timestamp::now(),
                ))
                .unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark publish-to-delivery latency with many live subscriptions
fn bench_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let key = TopicKey::try_new("bench").unwrap();
    let mut group = c.benchmark_group("fanout");

    for subscribers in [1_usize, 16, 64] {
        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &subscribers| {
                let bus = bus(4);
                let received = Arc::new(AtomicUsize::new(0));
                let progress = Arc::new(Notify::new());
                let handles: Vec<_> = rt.block_on(async {
                    (0..subscribers)
                        .map(|_| {
                            let info =
                                SubscriberInfo::new(SubscriberId::generate(), [key.clone()]);
                            let subscriber = Counting {
                                received: Arc::clone(&received),
                                progress: Arc::clone(&progress),
                            };
                            bus.subscribe(info, Some("d-"), subscriber, 100).unwrap()
                        })
                        .collect()
                });

                let next = AtomicU64::new(1);
                b.to_async(&rt).iter(|| {
                    let id = next.fetch_add(1, Ordering::Relaxed);
                    let stream = usize::try_from(id % 4).unwrap();
                    let bus = bus.clone();
                    let key = key.clone();
                    let received = Arc::clone(&received);
                    let progress = Arc::clone(&progress);
                    async move {
                        let target = received.load(Ordering::Relaxed) + subscribers;
                        bus.publish(
                            StreamIndex::new(stream),
                            MessageId::new(id),
                            batch(&key, 1),
                            Timestamp::now(),
                        )
                        .unwrap();
                        while received.load(Ordering::Relaxed) < target {
                            progress.notified().await;
                        }
                    }
                });

                rt.block_on(async {
                    for handle in handles {
                        handle.dispose().await;
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_publish, bench_fanout);
criterion_main!(benches);
