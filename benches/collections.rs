//! Benchmarks for the arena-backed containers.
//!
//! Run with: cargo bench --bench collections

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tagtrack::allocators::arena::{LlmArena, DEFAULT_PAGE_SIZE};
use tagtrack::collections::{Address, LlmArray, LlmMap};

fn arena() -> Arc<LlmArena> {
    Arc::new(LlmArena::new(DEFAULT_PAGE_SIZE))
}

fn bench_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("llm_map");

    for size in [64usize, 1024, 16 * 1024] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("add_remove", size), &size, |b, &size| {
            let mut map: LlmMap<Address, u32, u64> = LlmMap::new(arena());
            b.iter(|| {
                for i in 0..size {
                    map.add(Address(0x1000 + i * 16), i as u32, 16).unwrap();
                }
                for i in 0..size {
                    black_box(map.remove(&Address(0x1000 + i * 16)));
                }
            })
        });

        let mut map: LlmMap<Address, u32, u64> = LlmMap::new(arena());
        for i in 0..size {
            map.add(Address(0x1000 + i * 16), i as u32, 16).unwrap();
        }
        group.bench_with_input(BenchmarkId::new("find", size), &size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    black_box(map.find(&Address(0x1000 + i * 16)));
                }
            })
        });
    }

    group.finish();
}

fn bench_array(c: &mut Criterion) {
    let mut group = c.benchmark_group("llm_array");

    group.bench_function("push_1000", |b| {
        let arena = arena();
        b.iter(|| {
            let mut array = LlmArray::new(arena.clone());
            for i in 0..1000u64 {
                array.push(i).unwrap();
            }
            black_box(array.len())
        })
    });

    group.bench_function("inline_push_pop", |b| {
        let mut array = LlmArray::new(arena());
        b.iter(|| {
            array.push(black_box(7u32)).unwrap();
            black_box(array.pop())
        })
    });

    group.finish();
}

fn bench_arena(c: &mut Criterion) {
    let arena = arena();

    c.bench_function("arena_alloc_free_64b", |b| {
        b.iter(|| {
            if let Some(ptr) = arena.alloc(64, 8) {
                // SAFETY: `ptr` was just allocated from `arena` with this size and alignment.
                unsafe { arena.free(ptr, 64, 8) };
            }
        })
    });
}

criterion_group!(benches, bench_map, bench_array, bench_arena);
criterion_main!(benches);
