//! Allocation path benchmarks.
//!
//! Core paths run on simulated memory; the `abi_*` group goes through the
//! exported functions and compares against the system allocator.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tagheap_core::{MallocState, SimulatedMemory};

const SIZES: [usize; 4] = [16, 256, 2048, 64 * 1024];

fn bench_core_malloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("core_malloc_free");
    for size in SIZES {
        let mut heap = MallocState::new(SimulatedMemory::new());
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let p = heap.malloc(black_box(size)).expect("malloc");
                heap.free(black_box(p)).expect("free");
            });
        });
    }
    group.finish();
}

fn bench_core_fragmented(c: &mut Criterion) {
    // Every other block freed: lists stay populated and frees coalesce.
    let mut heap = MallocState::new(SimulatedMemory::new());
    let blocks: Vec<usize> = (0..1024)
        .map(|i| heap.malloc(32 + (i % 17) * 24).expect("malloc"))
        .collect();
    for p in blocks.iter().step_by(2) {
        heap.free(*p).expect("free");
    }
    c.bench_function("core_fragmented_bin_hit", |b| {
        b.iter(|| {
            let p = heap.malloc(black_box(100)).expect("malloc");
            heap.free(p).expect("free");
        });
    });
}

fn bench_core_realloc_growth(c: &mut Criterion) {
    c.bench_function("core_realloc_double_to_1m", |b| {
        let mut heap = MallocState::new(SimulatedMemory::new());
        b.iter(|| {
            let mut p = heap.malloc(16).expect("malloc");
            let mut size = 16;
            while size < 1 << 20 {
                size *= 2;
                p = heap
                    .realloc(p, size)
                    .expect("realloc")
                    .expect("non-zero size");
            }
            heap.free(p).expect("free");
        });
    });
}

fn bench_abi_vs_system(c: &mut Criterion) {
    let mut group = c.benchmark_group("abi_malloc_free");
    for size in SIZES {
        group.bench_with_input(BenchmarkId::new("tagheap", size), &size, |b, &size| {
            b.iter(|| {
                // SAFETY: the block is freed once right after allocation.
                unsafe {
                    let p = tagheap_abi::tagheap_malloc(black_box(size));
                    tagheap_abi::tagheap_free(black_box(p));
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &size| {
            b.iter(|| {
                // SAFETY: the block is freed once right after allocation.
                unsafe {
                    let p = libc::malloc(black_box(size));
                    libc::free(black_box(p));
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_core_malloc_free,
    bench_core_fragmented,
    bench_core_realloc_growth,
    bench_abi_vs_system
);
criterion_main!(benches);
