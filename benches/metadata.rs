//! Benchmarks for the two suballocation algorithms.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use heapalloc::{VirtualAllocationDesc, VirtualBlock, VirtualBlockDesc, VirtualBlockFlags};

const BLOCK_SIZE: u64 = 256 << 20;

fn bench_tlsf(c: &mut Criterion) {
    let mut group = c.benchmark_group("tlsf");

    group.bench_function("alloc_free_4kib_1000x", |b| {
        let mut block = VirtualBlock::new(&VirtualBlockDesc::new(BLOCK_SIZE)).unwrap();
        b.iter(|| {
            let mut handles = Vec::with_capacity(1000);
            for _ in 0..1000 {
                let (h, offset) = block
                    .allocate(&VirtualAllocationDesc::new(4096).with_alignment(256))
                    .unwrap();
                black_box(offset);
                handles.push(h);
            }
            for h in handles {
                block.free_allocation(h);
            }
        })
    });

    group.bench_function("alloc_mixed_sizes_1000x", |b| {
        let mut block = VirtualBlock::new(&VirtualBlockDesc::new(BLOCK_SIZE)).unwrap();
        b.iter(|| {
            let mut handles = Vec::with_capacity(1000);
            for i in 0..1000u64 {
                let size = 256 + (i % 64) * 1024;
                let (h, _) = block.allocate(&VirtualAllocationDesc::new(size)).unwrap();
                handles.push(h);
            }
            // Free every other allocation first to fragment, then the rest.
            for h in handles.iter().step_by(2) {
                block.free_allocation(*h);
            }
            for h in handles.iter().skip(1).step_by(2) {
                block.free_allocation(*h);
            }
        })
    });

    group.finish();
}

fn bench_linear(c: &mut Criterion) {
    let mut group = c.benchmark_group("linear");

    group.bench_function("ring_fill_drain_1000x", |b| {
        let mut desc = VirtualBlockDesc::new(BLOCK_SIZE);
        desc.flags = VirtualBlockFlags::ALGORITHM_LINEAR;
        let mut block = VirtualBlock::new(&desc).unwrap();
        b.iter(|| {
            let mut handles = Vec::with_capacity(1000);
            for _ in 0..1000 {
                let (h, _) = block
                    .allocate(&VirtualAllocationDesc::new(4096).with_alignment(256))
                    .unwrap();
                handles.push(h);
            }
            // FIFO release, the pattern the ring is built for.
            for h in handles {
                block.free_allocation(h);
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_tlsf, bench_linear);
criterion_main!(benches);
