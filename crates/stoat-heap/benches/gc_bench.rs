//! Heap benchmarks
//!
//! Measures bump-allocation throughput and collection pause for a live
//! set of varying size.
//!
//! Run with: `cargo bench -p stoat-heap`

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use std::hint::black_box;
use stoat_heap::{collect, Heap, Value};

fn alloc_benchmark(c: &mut Criterion) {
    c.bench_function("alloc_1k_strings", |b| {
        b.iter_batched(
            || Heap::new(1 << 20),
            |mut heap| {
                for _ in 0..1000 {
                    black_box(heap.alloc_string("hello stoat world"));
                }
                heap
            },
            BatchSize::SmallInput,
        )
    });
}

/// Build a heap whose root array keeps `n` strings alive.
fn populated_heap(n: u32) -> Heap {
    let mut heap = Heap::new(1 << 20);
    let arr = heap.alloc_array_of_nulls(n).unwrap();
    heap.set_root(Value::Object(arr));
    for i in 0..n {
        let s = heap.alloc_string("benchmark payload").unwrap();
        let arr = heap.root_object().unwrap();
        heap.array_set(arr, i, Value::Object(s));
    }
    heap
}

fn collect_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect");
    for n in [100u32, 1000, 5000] {
        group.bench_with_input(BenchmarkId::new("live_strings", n), &n, |b, &n| {
            b.iter_batched(
                || populated_heap(n),
                |mut heap| {
                    black_box(collect(&mut heap));
                    heap
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, alloc_benchmark, collect_benchmark);
criterion_main!(benches);
