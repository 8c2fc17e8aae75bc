mod common;

use std::time::Duration;

use bulwark::{
    FixedWindowStore, RateLimitStore, ResilienceConfig, SlidingWindowStore, TokenBucket,
    TokenBucketError,
};
use common::*;
use http::StatusCode;

/// Behaviour every store shares, regardless of how it counts.
async fn exercise_contract<S: RateLimitStore>(store: S) {
    let first = store.increment("k").await;
    assert_eq!((first.current, first.remaining), (1, 2));
    assert!(!first.is_exceeded());

    store.increment("k").await;
    store.increment("k").await;
    let over = store.increment("k").await;
    assert_eq!(over.current, 4);
    assert_eq!(over.remaining, 0);
    assert!(over.is_exceeded());

    store.decrement("k").await;
    assert_eq!(store.increment("k").await.current, 4);

    assert_eq!(store.increment("other").await.current, 1);
    store.reset("k").await;
    assert_eq!(store.increment("k").await.current, 1);

    store.reset_all().await;
    assert_eq!(store.increment("other").await.current, 1);

    // Decrementing an unknown key is a no-op.
    store.decrement("missing").await;
}

#[tokio::test(start_paused = true)]
async fn fixed_window_contract() {
    exercise_contract(FixedWindowStore::new(Duration::from_secs(60), 3)).await;
}

#[tokio::test(start_paused = true)]
async fn sliding_window_contract() {
    exercise_contract(SlidingWindowStore::new(Duration::from_secs(60), 3)).await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_increments_observe_distinct_counts() {
    let store = FixedWindowStore::new(Duration::from_secs(60), 1000);
    let handles: Vec<_> = (0..50)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.increment("shared").await.current })
        })
        .collect();

    let mut seen = Vec::new();
    for handle in handles {
        seen.push(handle.await.unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=50).collect::<Vec<u64>>());
}

#[tokio::test(start_paused = true)]
async fn fixed_window_resets_wholesale_sliding_does_not() {
    let fixed = FixedWindowStore::new(Duration::from_secs(1), 2);
    let sliding = SlidingWindowStore::new(Duration::from_secs(1), 2);

    fixed.increment("k").await;
    sliding.increment("k").await;
    tokio::time::advance(Duration::from_millis(999)).await;
    assert_eq!(fixed.increment("k").await.current, 2);
    assert_eq!(sliding.increment("k").await.current, 2);

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(fixed.increment("k").await.current, 1);
    assert!(!fixed.increment("k").await.is_exceeded());

    // Only the request from a second ago has left the sliding window.
    assert_eq!(sliding.increment("k").await.current, 2);
    let info = sliding.increment("k").await;
    assert!(info.is_exceeded());
    assert_eq!(info.reset_after(), Duration::from_millis(999));
}

#[tokio::test(start_paused = true)]
async fn key_population_is_capped() {
    let store = FixedWindowStore::new(Duration::from_secs(60), 5).max_keys(20);
    for i in 0..100 {
        store.increment(&format!("client-{i}")).await;
    }
    assert!(store.tracked_keys() <= 20, "{}", store.tracked_keys());
    // The newest key survives eviction.
    assert_eq!(store.increment("client-99").await.current, 2);
}

#[tokio::test(start_paused = true)]
async fn token_bucket_paces_callers() {
    let bucket = TokenBucket::new(2, 4.0);
    let start = tokio::time::Instant::now();
    for _ in 0..4 {
        bucket.acquire(1).await.unwrap();
    }
    // Two tokens up front, then one every 250ms.
    assert_eq!(start.elapsed(), Duration::from_millis(500));

    assert!(matches!(
        bucket.acquire(3).await,
        Err(TokenBucketError::ExceedsCapacity { .. })
    ));

    let dry = TokenBucket::new(1, 0.0);
    dry.acquire(1).await.unwrap();
    assert_eq!(dry.acquire(1).await, Err(TokenBucketError::NoRefill));
}

#[tokio::test(start_paused = true)]
async fn config_builds_layered_limiters() {
    let config = ResilienceConfig::from_toml(
        r#"
        [rate_limit]
        max = 3
        window = "1m"

        [sliding_window]
        max = 2
        window = "1s"
        legacy_headers = true
        "#,
    )
    .unwrap();

    let (handler, count) = counting_handler(StatusCode::OK);
    let mut svc = config.apply_rate_limits(handler).unwrap();

    assert_eq!(send(&mut svc, request("/")).await.status(), StatusCode::OK);
    assert_eq!(send(&mut svc, request("/")).await.status(), StatusCode::OK);
    let rejected = send(&mut svc, request("/")).await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    // Rejected by the inner sliding window, which adds legacy headers.
    assert_eq!(header(&rejected, "x-ratelimit-limit"), Some("2"));

    tokio::time::advance(Duration::from_secs(2)).await;
    let rejected = send(&mut svc, request("/")).await;
    // The outer fixed window has now seen four requests.
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&rejected, "ratelimit-limit"), Some("3"));
    assert!(header(&rejected, "x-ratelimit-limit").is_none());
    assert_eq!(calls(&count), 2);
}
