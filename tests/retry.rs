use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bulwark::retry::{RetryOptions, retry, retry_with_circuit_breaker, with_timeout};
use bulwark::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, DatabaseErrorKind,
    Error, Resilience,
};
use http::StatusCode;
use tokio::time::Instant;

fn fixed_schedule() -> RetryOptions<Error> {
    RetryOptions::default()
        .max_attempts(3)
        .base_delay(Duration::from_millis(100))
        .backoff_factor(2.0)
        .jitter(false)
}

#[tokio::test(start_paused = true)]
async fn exhausts_attempts_with_backoff() {
    let calls = AtomicUsize::new(0);
    let delays = Arc::new(Mutex::new(Vec::new()));
    let exhausted = Arc::new(AtomicUsize::new(0));

    let seen = delays.clone();
    let gave_up = exhausted.clone();
    let options = fixed_schedule()
        .on_retry(move |attempt| seen.lock().unwrap().push((attempt.attempt, attempt.delay)))
        .on_max_attempts_reached(move |_| {
            gave_up.fetch_add(1, Ordering::SeqCst);
        });

    let start = Instant::now();
    let err = retry(&options, || async {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err::<(), _>(Error::network(format!("reset #{n}")))
    })
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(start.elapsed(), Duration::from_millis(300));
    assert_eq!(err, Error::network("reset #3"));
    assert_eq!(
        *delays.lock().unwrap(),
        vec![
            (1, Duration::from_millis(100)),
            (2, Duration::from_millis(200)),
        ]
    );
    assert_eq!(exhausted.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_error_is_returned_immediately() {
    let calls = AtomicUsize::new(0);
    let exhausted = Arc::new(AtomicUsize::new(0));
    let gave_up = exhausted.clone();
    let options = fixed_schedule().on_max_attempts_reached(move |_| {
        gave_up.fetch_add(1, Ordering::SeqCst);
    });

    let err = retry(&options, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(Error::Validation("email is required".into()))
    })
    .await
    .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(exhausted.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn succeeds_after_transient_failure_with_jitter() {
    let calls = AtomicUsize::new(0);
    let start = Instant::now();

    let value = retry(&RetryOptions::<Error>::default(), || async {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(Error::status(StatusCode::SERVICE_UNAVAILABLE, "warming up"))
        } else {
            Ok(42)
        }
    })
    .await
    .unwrap();

    assert_eq!(value, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_secs(1) && elapsed <= Duration::from_millis(1100),
        "{elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn open_circuit_stops_retrying() {
    let breaker = CircuitBreaker::new(
        "ledger",
        CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        },
    );
    let calls = AtomicUsize::new(0);
    let retried = Arc::new(AtomicUsize::new(0));
    let hook = retried.clone();
    let options = fixed_schedule().max_attempts(5).on_retry(move |_| {
        hook.fetch_add(1, Ordering::SeqCst);
    });

    let err = retry_with_circuit_breaker(&breaker, &options, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(Error::network("connection refused"))
    })
    .await
    .unwrap_err();

    assert!(matches!(err, CircuitBreakerError::Open { ref name } if name == "ledger"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(retried.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_future_cancels_pending_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let options = fixed_schedule().max_attempts(10);

    let outcome = tokio::time::timeout(
        Duration::from_millis(150),
        retry(&options, move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::network("connection refused"))
            }
        }),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn timed_out_attempts_are_retried() {
    let calls = AtomicUsize::new(0);
    let value = retry(&fixed_schedule(), || async {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        with_timeout(Duration::from_secs(1), async move {
            if n == 0 {
                std::future::pending::<()>().await;
            }
            Ok::<_, Error>("done")
        })
        .await
    })
    .await
    .unwrap();

    assert_eq!(value, "done");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let err = with_timeout::<(), Error, _>(
        Duration::from_millis(250),
        std::future::pending(),
    )
    .await
    .unwrap_err();
    assert_eq!(err, Error::Timeout(Duration::from_millis(250)));
}

#[tokio::test(start_paused = true)]
async fn database_preset_retries_connection_errors_only() {
    let options = RetryOptions::database().jitter(false);
    let calls = AtomicUsize::new(0);
    let start = Instant::now();
    let _ = retry(&options, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(Error::database(DatabaseErrorKind::Connection, "pool exhausted"))
    })
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(start.elapsed(), Duration::from_millis(2500));

    let calls = AtomicUsize::new(0);
    let _ = retry(&options, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(Error::database(DatabaseErrorKind::Constraint, "duplicate key"))
    })
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn file_preset_waits_out_missing_files() {
    let options = RetryOptions::file().jitter(false);
    let calls = AtomicUsize::new(0);
    let start = Instant::now();
    let contents = retry(&options, || async {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(io::Error::new(io::ErrorKind::NotFound, "not yet written"))
        } else {
            Ok("payload")
        }
    })
    .await
    .unwrap();

    assert_eq!(contents, "payload");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(start.elapsed(), Duration::from_millis(1100));
}

#[tokio::test(start_paused = true)]
async fn external_api_calls_share_a_named_breaker() {
    let resilience = Resilience::new();
    let calls = AtomicUsize::new(0);

    let err = resilience
        .retry_external_api_call("github", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::status(StatusCode::NOT_FOUND, "no such repo"))
        })
        .await
        .unwrap_err();
    assert_eq!(
        err.into_operation().and_then(|e| e.status_code()),
        Some(StatusCode::NOT_FOUND)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let value = resilience
        .retry_external_api_call("github", || async { Ok::<_, Error>("starred") })
        .await
        .unwrap();
    assert_eq!(value, "starred");

    let breakers = resilience.breakers().snapshot();
    assert_eq!(breakers.len(), 1);
    assert_eq!(breakers["external-api-github"], CircuitState::Closed);
}
