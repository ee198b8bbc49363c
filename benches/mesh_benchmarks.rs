// ABOUTME: Benchmark suite for the framing and marshaling layers
// ABOUTME: Measures frame round-tripping and freeze/liven traversal cost

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use meshrpc::error::Result;
use meshrpc::framer::{encode_frame, Framer};
use meshrpc::marshal::{freeze, liven, GetFunction, StoreFunction};
use meshrpc::value::{procedure, ProcedureRef, Value};
use std::time::Duration;

struct CountingStore(u32);
impl StoreFunction for CountingStore {
    fn store(&mut self, _proc: ProcedureRef) -> Result<u32> {
        self.0 += 1;
        Ok(self.0)
    }
}

struct NullGet;
impl GetFunction for NullGet {
    fn get(&mut self, _key: u32) -> ProcedureRef {
        procedure(|_args| async {})
    }
}

fn bench_framer_single_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer");

    for payload_size in [16usize, 256, 4096] {
        let payload = vec![0xABu8; payload_size];
        let frame = encode_frame(&payload);

        group.bench_with_input(
            BenchmarkId::new("whole_frame", payload_size),
            &frame,
            |b, frame| {
                b.iter(|| {
                    let mut framer = Framer::new();
                    framer.push(black_box(frame));
                    black_box(framer.next_frame())
                })
            },
        );
    }

    group.finish();
}

fn bench_framer_byte_at_a_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer_chunked");
    group.measurement_time(Duration::from_secs(5));

    let payload = vec![0xCDu8; 256];
    let frame = encode_frame(&payload);

    group.bench_function("256_bytes_one_at_a_time", |b| {
        b.iter(|| {
            let mut framer = Framer::new();
            let mut frames = Vec::new();
            for byte in frame.iter() {
                framer.push(black_box(&[*byte]));
                while let Some(f) = framer.next_frame() {
                    frames.push(f);
                }
            }
            black_box(frames)
        })
    });

    group.finish();
}

fn sample_value(depth: usize, width: usize) -> Value {
    if depth == 0 {
        return Value::Int(42);
    }
    let mut entries = indexmap::IndexMap::new();
    for i in 0..width {
        entries.insert(format!("k{i}"), sample_value(depth - 1, width));
    }
    Value::map(entries)
}

fn bench_freeze_liven(c: &mut Criterion) {
    let mut group = c.benchmark_group("marshal");

    for (depth, width) in [(2, 4), (3, 4), (4, 3)] {
        let value = sample_value(depth, width);
        group.bench_with_input(
            BenchmarkId::new("freeze", format!("{depth}x{width}")),
            &value,
            |b, value| {
                b.iter(|| {
                    let mut store = CountingStore(0);
                    black_box(freeze(black_box(value), &mut store).unwrap())
                })
            },
        );

        let mut store = CountingStore(0);
        let wire = freeze(&value, &mut store).unwrap();
        group.bench_with_input(
            BenchmarkId::new("liven", format!("{depth}x{width}")),
            &wire,
            |b, wire| {
                b.iter(|| {
                    let mut get = NullGet;
                    black_box(liven(black_box(wire), &mut get))
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_framer_single_frame,
    bench_framer_byte_at_a_time,
    bench_freeze_liven
);
criterion_main!(benches);
