use std::time::Duration;

use bulwark::http::{Body, BoxError, HttpService, boxed, empty_body, full_body};
use bulwark::middleware::RateLimit;
use bulwark::{
    CircuitBreaker, CircuitBreakerConfig, FixedWindowStore, RateLimitStore, SlidingWindowStore,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use http::{Request, Response};
use tokio::runtime::Runtime;
use tower::{Layer, Service, ServiceExt};

fn ok_handler() -> HttpService {
    boxed(tower::service_fn(|_req: Request<Body>| async {
        Ok::<_, BoxError>(Response::new(full_body("ok")))
    }))
}

fn request(i: usize) -> Request<Body> {
    Request::builder()
        .uri("/")
        .header("x-forwarded-for", format!("10.0.{}.{}", (i / 256) % 256, i % 256))
        .body(empty_body())
        .unwrap()
}

fn store_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("stores");
    group.measurement_time(Duration::from_secs(5));

    for keys in [1usize, 1_000] {
        let fixed = FixedWindowStore::new(Duration::from_secs(60), u64::MAX);
        let names: Vec<String> = (0..keys).map(|i| format!("client-{i}")).collect();
        group.bench_with_input(BenchmarkId::new("fixed_increment", keys), &names, |b, names| {
            let mut i = 0;
            b.to_async(&rt).iter(|| {
                i += 1;
                let key = &names[i % names.len()];
                let store = fixed.clone();
                async move { store.increment(key).await }
            });
        });

        let sliding = SlidingWindowStore::new(Duration::from_secs(1), u64::MAX);
        group.bench_with_input(BenchmarkId::new("sliding_increment", keys), &names, |b, names| {
            let mut i = 0;
            b.to_async(&rt).iter(|| {
                i += 1;
                let key = &names[i % names.len()];
                let store = sliding.clone();
                async move { store.increment(key).await }
            });
        });
    }

    group.finish();
}

fn middleware_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("middleware");

    let mut baseline = ok_handler();
    group.bench_function("baseline", |b| {
        let mut i = 0;
        b.iter(|| {
            i += 1;
            rt.block_on(async { baseline.ready().await.unwrap().call(request(i)).await.unwrap() })
        });
    });

    let mut limited = RateLimit::new(Duration::from_secs(60), u64::MAX).layer(ok_handler());
    group.bench_function("rate_limit", |b| {
        let mut i = 0;
        b.iter(|| {
            i += 1;
            rt.block_on(async { limited.ready().await.unwrap().call(request(i)).await.unwrap() })
        });
    });

    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());
    group.bench_function("circuit_breaker_closed", |b| {
        b.to_async(&rt)
            .iter(|| breaker.execute(|| async { Ok::<_, bulwark::Error>(()) }));
    });

    group.finish();
}

criterion_group!(benches, store_benchmarks, middleware_benchmarks);
criterion_main!(benches);
