//! Allocation throughput and minor-pause benchmarks.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use gengc::object::Descriptor;
use gengc::{approximate_stack_base, Collector, GcConfig, RuntimeCallbacks, StackMark};
use std::sync::Arc;

#[repr(C)]
struct BenchClass {
    size: usize,
}

fn object_size(_obj: usize, vtable: usize) -> usize {
    unsafe { (*(vtable as *const BenchClass)).size }
}

fn no_refs(_vtable: usize) -> Descriptor {
    Descriptor::EMPTY
}

fn bench_collector(nursery_size: usize) -> (Arc<Collector>, usize) {
    let callbacks = RuntimeCallbacks {
        object_size,
        reference_bitmap: no_refs,
        ..Default::default()
    };
    let config = GcConfig {
        nursery_size,
        max_heap_size: 256 * 1024 * 1024,
        soft_heap_limit: 256 * 1024 * 1024,
        workers: 1,
        stack_mark: StackMark::Precise,
        ..Default::default()
    };
    let gc = Collector::new(config, callbacks).expect("collector init");
    gc.register_thread(approximate_stack_base(), Some(empty_marker));
    let class = Box::leak(Box::new(BenchClass { size: 32 })) as *const BenchClass as usize;
    (gc, class)
}

fn empty_marker(_info: &gengc::ThreadInfo, _relay: &mut dyn FnMut(*mut usize)) {}

fn alloc_throughput(c: &mut Criterion) {
    let (gc, class) = bench_collector(64 * 1024 * 1024);
    let mut group = c.benchmark_group("alloc");
    group.throughput(Throughput::Bytes(32));
    group.bench_function("tlab_bump_32b", |b| {
        b.iter(|| {
            let obj = gc.alloc(32, class).expect("alloc");
            criterion::black_box(obj);
        })
    });
    group.finish();
}

fn minor_pause(c: &mut Criterion) {
    let (gc, class) = bench_collector(4 * 1024 * 1024);
    c.bench_function("minor_collection_empty_nursery", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                let _ = gc.alloc(32, class);
            }
            gc.collect(0);
        })
    });
}

criterion_group!(benches, alloc_throughput, minor_pause);
criterion_main!(benches);
