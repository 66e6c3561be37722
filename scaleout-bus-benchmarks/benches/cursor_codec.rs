use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use scaleout_bus::{Cursor, MessageId, StreamIndex};

fn random_cursor(streams: usize) -> Cursor {
    let mut rng = rand::rng();
    Cursor::explicit(
        (0..streams).map(|stream| (StreamIndex::new(stream), MessageId::new(rng.random()))),
    )
}

/// Benchmark cursor encoding
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("cursor_encode");

    for streams in [1_usize, 8, 64] {
        group.throughput(Throughput::Elements(streams as u64));
        let cursor = random_cursor(streams);
        group.bench_with_input(BenchmarkId::new("streams", streams), &cursor, |b, cursor| {
            b.iter(|| black_box(cursor.to_string()));
        });
    }
    group.finish();
}

/// Benchmark cursor decoding, including the rejection of garbled text
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("cursor_decode");

    for streams in [1_usize, 8, 64] {
        group.throughput(Throughput::Elements(streams as u64));
        let text = random_cursor(streams).to_string();
        group.bench_with_input(BenchmarkId::new("streams", streams), &text, |b, text| {
            b.iter(|| black_box(Cursor::decode(Some(text)).unwrap()));
        });
    }

    group.bench_function("garbled", |b| {
        b.iter(|| black_box(Cursor::decode(Some("s-0,1f|1;0")).is_err()));
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
