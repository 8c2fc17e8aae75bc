use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bulwark::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitState, Error,
};

fn breaker() -> CircuitBreaker {
    CircuitBreaker::new(
        "inventory",
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            ..Default::default()
        },
    )
}

async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<Error>> {
    cb.execute(|| async { Err(Error::network("connection refused")) })
        .await
}

async fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<Error>> {
    cb.execute(|| async { Ok::<_, Error>(()) }).await
}

#[tokio::test(start_paused = true)]
async fn opens_after_threshold_and_rejects_without_calling() {
    let cb = breaker();
    for _ in 0..3 {
        let err = fail(&cb).await.unwrap_err();
        assert_eq!(err.into_operation(), Some(Error::network("connection refused")));
    }
    assert_eq!(cb.state(), CircuitState::Open);

    let calls = AtomicUsize::new(0);
    let err = cb
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(())
        })
        .await
        .unwrap_err();
    assert!(err.is_open());
    assert_eq!(err.to_string(), "circuit breaker `inventory` is open");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn half_open_probe_recovers_or_reopens() {
    let cb = breaker();
    for _ in 0..3 {
        let _ = fail(&cb).await;
    }

    // Exactly the reset timeout is not enough.
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(succeed(&cb).await.unwrap_err().is_open());

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(fail(&cb).await.unwrap_err().into_operation().is_some());
    assert_eq!(cb.state(), CircuitState::Open);
    assert!(succeed(&cb).await.unwrap_err().is_open());

    tokio::time::advance(Duration::from_millis(30_001)).await;
    succeed(&cb).await.unwrap();
    assert_eq!(cb.state(), CircuitState::HalfOpen);
    assert_eq!(cb.success_count(), 1);
    succeed(&cb).await.unwrap();
    succeed(&cb).await.unwrap();
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn success_while_closed_resets_failures() {
    let cb = breaker();
    let _ = fail(&cb).await;
    let _ = fail(&cb).await;
    succeed(&cb).await.unwrap();
    let _ = fail(&cb).await;
    let _ = fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.failure_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn probe_in_flight_rejects_other_calls() {
    let cb = breaker();
    for _ in 0..3 {
        let _ = fail(&cb).await;
    }
    tokio::time::advance(Duration::from_secs(31)).await;

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let probe = cb.execute(|| async move {
        rx.await.map_err(|_| Error::Other("sender dropped".into()))
    });
    tokio::pin!(probe);
    assert!(futures::poll!(probe.as_mut()).is_pending());
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    assert!(succeed(&cb).await.unwrap_err().is_open());

    tx.send(()).unwrap();
    probe.await.unwrap();
    assert_eq!(cb.success_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_probe_frees_its_slot() {
    let cb = breaker();
    for _ in 0..3 {
        let _ = fail(&cb).await;
    }
    tokio::time::advance(Duration::from_secs(31)).await;

    {
        let probe = cb.execute(|| std::future::pending::<Result<(), Error>>());
        tokio::pin!(probe);
        assert!(futures::poll!(probe.as_mut()).is_pending());
    }

    // Cancellation is neither a success nor a failure.
    assert_eq!(cb.state(), CircuitState::HalfOpen);
    assert_eq!(cb.success_count(), 0);
    succeed(&cb).await.unwrap();
    assert_eq!(cb.success_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn registry_shares_state_across_callers() {
    let registry = CircuitBreakerRegistry::new();
    let config = CircuitBreakerConfig {
        failure_threshold: 1,
        ..Default::default()
    };

    let callers: Vec<Arc<CircuitBreaker>> = (0..3)
        .map(|_| registry.get_or_create("payments", &config))
        .collect();
    let _ = fail(&callers[0]).await;
    for cb in &callers {
        assert_eq!(cb.state(), CircuitState::Open);
    }

    registry.get_or_create("search", &config);
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot["payments"], CircuitState::Open);
    assert_eq!(snapshot["search"], CircuitState::Closed);
    assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");

    registry.reset_all();
    succeed(&callers[2]).await.unwrap();
}
