use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use tollgate::{
    CacheKey, CachePolicy, CacheStore, Dispatcher, LimiterConfig, NullSink, RateLimitRegistry,
    TollgateConfig,
};

// Large enough that the bucket never empties during a run.
fn unlimited() -> TollgateConfig {
    TollgateConfig {
        limiter: LimiterConfig::new(u32::MAX, u32::MAX).unwrap(),
        ..TollgateConfig::default()
    }
}

fn dispatch_uncached(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dispatcher = Dispatcher::from_config(&unlimited(), NullSink).unwrap();

    c.bench_function("dispatch_uncached", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(
                dispatcher.dispatch("bench", || async { Ok::<_, std::io::Error>(1u64) }).await,
            );
        });
    });
}

fn dispatch_cache_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dispatcher = Dispatcher::from_config(&unlimited(), NullSink).unwrap();
    let policy = CachePolicy::new(CacheKey::token(1, "0xABC"), Duration::from_secs(3600));

    c.bench_function("dispatch_cache_hit", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(
                dispatcher
                    .dispatch_cached("bench", policy.clone(), || async {
                        Ok::<_, std::io::Error>("USDC".to_string())
                    })
                    .await,
            );
        });
    });
}

fn registry_many_partitions(c: &mut Criterion) {
    let registry = RateLimitRegistry::new(LimiterConfig::default()).unwrap();
    let keys: Vec<String> = (0..1024).map(|i| format!("partition-{i}")).collect();
    let mut i = 0usize;

    c.bench_function("registry_is_allowed_1024_keys", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(registry.is_allowed(black_box(&keys[i])));
        });
    });
}

fn cache_get_hit(c: &mut Criterion) {
    let cache = CacheStore::new();
    cache.insert("price-1-0xA-USD", 1.0f64, Duration::from_secs(3600));

    c.bench_function("cache_get_hit", |b| {
        b.iter(|| black_box(cache.get::<f64>(black_box("price-1-0xA-USD"))));
    });
}

criterion_group!(
    benches,
    dispatch_uncached,
    dispatch_cache_hit,
    registry_many_partitions,
    cache_get_hit
);
criterion_main!(benches);
