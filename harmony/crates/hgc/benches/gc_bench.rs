//! HGC Benchmarks
//!
//! Allocation, collection and safepoint costs.
//! Run with: `cargo bench --package hgc`

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use hgc::{GcConfig, ObjectBuilder, ReferenceQueue, Root, Runtime};

fn create_runtime() -> Runtime {
    let config = GcConfig {
        heap_capacity: 256 * 1024 * 1024,
        ..Default::default()
    };
    let runtime = Runtime::new(config).unwrap();
    runtime.start().unwrap();
    runtime
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");
    let runtime = create_runtime();

    let sizes = [16, 64, 256, 1024, 4096];
    for &size in &sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("size_{}", size), |b| {
            b.iter(|| black_box(runtime.allocate(ObjectBuilder::new(size)).unwrap()))
        });
    }

    group.bench_function("with_finalizer", |b| {
        b.iter(|| black_box(runtime.allocate(ObjectBuilder::new(64).finalizer(|_| {})).unwrap()))
    });

    group.finish();
}

fn bench_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection");
    let runtime = create_runtime();

    group.bench_function("empty_heap", |b| b.iter(|| runtime.collect().unwrap()));

    group.bench_function("live_list_1000", |b| {
        let head = build_list(&runtime, 1_000);
        b.iter(|| runtime.collect().unwrap());
        drop(head);
    });

    group.bench_function("garbage_1000", |b| {
        b.iter_batched(
            || {
                for _ in 0..1_000 {
                    drop(runtime.allocate(ObjectBuilder::new(64)).unwrap());
                }
            },
            |_| runtime.collect().unwrap(),
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

fn bench_reference_processing(c: &mut Criterion) {
    let mut group = c.benchmark_group("references");
    let runtime = create_runtime();
    let queue = ReferenceQueue::new();

    group.bench_function("weak_cleared_1000", |b| {
        b.iter_batched(
            || {
                (0..1_000)
                    .map(|_| {
                        let object = runtime.allocate(ObjectBuilder::new(32)).unwrap();
                        runtime.new_weak_reference(&object, Some(&queue)).unwrap()
                    })
                    .collect::<Vec<_>>()
            },
            |references| {
                runtime.collect().unwrap();
                while queue.poll().is_some() {}
                references
            },
            BatchSize::PerIteration,
        )
    });

    group.bench_function("soft_retained_1000", |b| {
        let kept: Vec<_> = (0..1_000)
            .map(|_| {
                let object = runtime.allocate(ObjectBuilder::new(32)).unwrap();
                runtime.new_soft_reference(&object, None).unwrap()
            })
            .collect();
        b.iter(|| runtime.collect().unwrap());
        drop(kept);
    });

    group.finish();
}

fn bench_safepoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("safepoint");
    let runtime = create_runtime();
    let mutator = runtime.attach_current_thread("bench").unwrap();

    group.bench_function("poll_fast_path", |b| b.iter(|| mutator.safepoint()));
    group.bench_function("check_safepoint", |b| b.iter(|| runtime.check_safepoint()));
    group.bench_function("blocking_region", |b| b.iter(|| mutator.blocking(|| black_box(1))));

    group.finish();
}

fn build_list(runtime: &Runtime, length: usize) -> Root {
    let heap = runtime.heap();
    let mut head = runtime.allocate(ObjectBuilder::new(16).fields(1)).unwrap();
    for _ in 1..length {
        let node = runtime.allocate(ObjectBuilder::new(16).fields(1)).unwrap();
        heap.set_field(&node, 0, Some(&head)).unwrap();
        head = node;
    }
    head
}

criterion_group!(
    benches,
    bench_allocation,
    bench_collection,
    bench_reference_processing,
    bench_safepoint
);
criterion_main!(benches);
