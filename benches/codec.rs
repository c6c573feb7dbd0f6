//! Header encode/decode cost at typical payload sizes
//!
//! Run: cargo bench --bench codec

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pubsub_bench::codec::{decode, encode, encode_into};
use pubsub_bench::PacketKind;
use std::hint::black_box;

const SIZES: [usize; 4] = [13, 64, 1024, 65_536];

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_into");
    for size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut buf = Vec::with_capacity(size);
            let mut seq = 0u32;
            b.iter(|| {
                encode_into(&mut buf, PacketKind::Data, seq, 1_700_000_000, black_box(size));
                seq = seq.wrapping_add(1);
                black_box(&buf);
            });
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for size in SIZES {
        let payload = encode(PacketKind::Data, 42, 1_700_000_000, size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| black_box(decode(black_box(payload))));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
