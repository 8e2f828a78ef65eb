//! Allocator micro-benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use shardalloc::{AllocConfig, ShardAlloc};

fn bench_small_alloc_free(c: &mut Criterion) {
    let heap = ShardAlloc::with_defaults();
    c.bench_function("small_alloc_free_64", |b| {
        b.iter(|| {
            let p = heap.alloc(black_box(64));
            unsafe { heap.free(p) };
        })
    });
}

fn bench_small_alloc_free_no_tcache(c: &mut Criterion) {
    let heap = ShardAlloc::new(AllocConfig::default().with_tcache(false));
    c.bench_function("small_alloc_free_64_no_tcache", |b| {
        b.iter(|| {
            let p = heap.alloc(black_box(64));
            unsafe { heap.free(p) };
        })
    });
}

fn bench_large_alloc_free(c: &mut Criterion) {
    let heap = ShardAlloc::with_defaults();
    c.bench_function("large_alloc_free_64k", |b| {
        b.iter(|| {
            let p = heap.alloc(black_box(64 * 1024));
            unsafe { heap.free(p) };
        })
    });
}

fn bench_mixed_sizes(c: &mut Criterion) {
    let heap = ShardAlloc::with_defaults();
    let sizes = [16usize, 48, 128, 512, 2048, 8192];
    c.bench_function("mixed_size_batch", |b| {
        b.iter(|| {
            let mut ptrs = [std::ptr::null_mut(); 6];
            for (i, &size) in sizes.iter().enumerate() {
                ptrs[i] = heap.alloc(size);
            }
            for p in ptrs {
                unsafe { heap.free(p) };
            }
        })
    });
}

fn bench_realloc_grow(c: &mut Criterion) {
    let heap = ShardAlloc::with_defaults();
    c.bench_function("realloc_grow_small", |b| {
        b.iter(|| unsafe {
            let p = heap.alloc(black_box(100));
            let q = heap.realloc(p, black_box(300));
            heap.free(q);
        })
    });
}

criterion_group!(
    benches,
    bench_small_alloc_free,
    bench_small_alloc_free_no_tcache,
    bench_large_alloc_free,
    bench_mixed_sizes,
    bench_realloc_grow
);
criterion_main!(benches);
