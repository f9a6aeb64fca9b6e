use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use stratamem::{MemoryCache, MemoryCacheConfig};

fn quiet_config() -> MemoryCacheConfig {
    MemoryCacheConfig {
        auto_trim_interval: Duration::ZERO,
        ..Default::default()
    }
}

fn bench_hot_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("hot_get");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_1kb_hot", |b| {
        let cache = MemoryCache::with_config(quiet_config());
        let data = vec![b'x'; 1024];

        for i in 0..100 {
            cache.set_with_cost(&format!("k{}", i), data.clone(), data.len());
        }

        let mut counter = 0;
        b.iter(|| {
            black_box(cache.get(&format!("k{}", counter % 100)));
            counter += 1;
        });
    });

    group.finish();
}

fn bench_mixed_50_50(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("50_read_50_write", |b| {
        let cache = MemoryCache::with_config(quiet_config());
        let data = vec![b'x'; 1024];

        for i in 0..100 {
            cache.set_with_cost(&format!("k{}", i), data.clone(), data.len());
        }

        let mut counter = 0u64;
        b.iter(|| {
            if counter.is_multiple_of(2) {
                black_box(cache.get(&format!("k{}", counter % 100)));
            } else {
                cache.set_with_cost(&format!("k{}", counter % 100), data.clone(), data.len());
            }
            counter += 1;
        });
    });

    group.finish();
}

fn bench_eviction_pressure(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert_with_count_limit_10", |b| {
        let cache = MemoryCache::with_config(MemoryCacheConfig {
            count_limit: 10,
            auto_trim_interval: Duration::ZERO,
            ..Default::default()
        });
        let data = vec![b'x'; 1024];

        let mut counter = 0u64;
        b.iter(|| {
            cache.set_with_cost(&format!("k{}", counter), data.clone(), data.len());
            counter += 1;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_hot_get, bench_mixed_50_50, bench_eviction_pressure);
criterion_main!(benches);
