//! Retry engine with exponential backoff and jitter.
//!
//! [`retry`] runs an operation until it succeeds, fails with an error the
//! retry condition rejects, or runs out of attempts. The last error is
//! returned as-is so the root cause stays visible to the caller.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use bulwark::Error;
//! use bulwark::retry::{RetryOptions, retry};
//!
//! # async fn fetch() -> Result<String, Error> { Ok(String::new()) }
//! # async fn run() -> Result<(), Error> {
//! let options = RetryOptions::<Error>::default()
//!     .max_attempts(4)
//!     .base_delay(Duration::from_millis(250));
//! let body = retry(&options, fetch).await?;
//! # Ok(())
//! # }
//! ```

pub mod conditions;

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::error::Classify;

type RetryCondition<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type OnRetry<E> = Arc<dyn Fn(&RetryAttempt<'_, E>) + Send + Sync>;
type OnMaxAttempts<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A failed attempt that is about to be retried.
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    /// Sleep before the next attempt, jitter included.
    pub delay: Duration,
    pub error: &'a E,
}

/// How [`retry`] schedules attempts and which failures it retries.
pub struct RetryOptions<E> {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    jitter: bool,
    label: Option<Cow<'static, str>>,
    retry_condition: RetryCondition<E>,
    on_retry: Option<OnRetry<E>>,
    on_max_attempts_reached: Option<OnMaxAttempts<E>>,
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            backoff_factor: self.backoff_factor,
            jitter: self.jitter,
            label: self.label.clone(),
            retry_condition: self.retry_condition.clone(),
            on_retry: self.on_retry.clone(),
            on_max_attempts_reached: self.on_max_attempts_reached.clone(),
        }
    }
}

impl<E: Classify + 'static> Default for RetryOptions<E> {
    /// 3 attempts, 1s base delay doubling up to 30s, jitter on, retrying
    /// failures classified as transient.
    fn default() -> Self {
        Self::new(conditions::default_condition::<E>)
    }
}

impl<E> RetryOptions<E> {
    /// Default schedule with a custom retry condition.
    pub fn new(condition: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
            label: None,
            retry_condition: Arc::new(condition),
            on_retry: None,
            on_max_attempts_reached: None,
        }
    }

    /// Total attempts including the first. Values below 1 are treated as 1.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Add up to 10% random delay on top of each backoff.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Name of the operation, recorded in retry log events.
    pub fn label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Replace the predicate deciding whether a failure is worth retrying.
    pub fn retry_condition(mut self, f: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.retry_condition = Arc::new(f);
        self
    }

    /// Called before sleeping ahead of each retry.
    pub fn on_retry(mut self, f: impl Fn(&RetryAttempt<'_, E>) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }

    /// Called with the final error when every attempt failed.
    pub fn on_max_attempts_reached(mut self, f: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.on_max_attempts_reached = Some(Arc::new(f));
        self
    }

    pub fn get_max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn should_retry(&self, error: &E) -> bool {
        (self.retry_condition)(error)
    }

    /// Backoff after the `attempt`-th failure, without jitter:
    /// `min(base * factor^(attempt - 1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let nanos = self.base_delay.as_nanos() as f64 * self.backoff_factor.powi(exponent);
        let cap = self.max_delay.as_nanos() as f64;
        let nanos = nanos.min(cap).max(0.0).round();
        Duration::from_nanos(nanos as u64)
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter {
            delay.mul_f64(1.0 + rand::random_range(0.0..0.1))
        } else {
            delay
        }
    }
}

impl<E: 'static> RetryOptions<E> {
    /// The same schedule and hooks, applied to calls made through a circuit
    /// breaker. Circuit-open rejections are never retried; hooks only see
    /// the dependency's own errors.
    fn through_breaker(&self) -> RetryOptions<CircuitBreakerError<E>> {
        let condition = self.retry_condition.clone();
        let on_retry = self.on_retry.clone();
        let on_max = self.on_max_attempts_reached.clone();

        RetryOptions {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            backoff_factor: self.backoff_factor,
            jitter: self.jitter,
            label: self.label.clone(),
            retry_condition: Arc::new(move |e: &CircuitBreakerError<E>| match e {
                CircuitBreakerError::Open { .. } => false,
                CircuitBreakerError::Operation(inner) => condition(inner),
            }),
            on_retry: on_retry.map(|f| -> OnRetry<CircuitBreakerError<E>> {
                Arc::new(move |a: &RetryAttempt<'_, CircuitBreakerError<E>>| {
                    if let CircuitBreakerError::Operation(inner) = a.error {
                        f(&RetryAttempt {
                            attempt: a.attempt,
                            delay: a.delay,
                            error: inner,
                        });
                    }
                })
            }),
            on_max_attempts_reached: on_max.map(|f| -> OnMaxAttempts<CircuitBreakerError<E>> {
                Arc::new(move |e: &CircuitBreakerError<E>| {
                    if let CircuitBreakerError::Operation(inner) = e {
                        f(inner);
                    }
                })
            }),
        }
    }
}

/// Run `operation` until it succeeds or a failure must be surfaced.
///
/// A failure is returned immediately when the retry condition rejects it,
/// and after the last attempt otherwise. Dropping the returned future
/// cancels the operation and any pending backoff sleep at once.
pub async fn retry<T, E, F, Fut>(options: &RetryOptions<E>, mut operation: F) -> Result<T, E>
where
    E: Classify,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = options.max_attempts;
    let label = options.label.as_deref().unwrap_or("operation");
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !options.should_retry(&err) {
            return Err(err);
        }

        if attempt >= max_attempts {
            tracing::warn!(
                operation = label,
                max_attempts,
                error_code = %err.code(),
                error = %err,
                "retry attempts exhausted"
            );
            if let Some(f) = &options.on_max_attempts_reached {
                f(&err);
            }
            return Err(err);
        }

        let delay = options.next_delay(attempt);
        if let Some(f) = &options.on_retry {
            f(&RetryAttempt {
                attempt,
                delay,
                error: &err,
            });
        }
        tracing::warn!(
            operation = label,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error_code = %err.code(),
            error = %err,
            "retrying operation"
        );

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Retry `operation` through `breaker`.
///
/// Each attempt goes through [`CircuitBreaker::execute`], so failures feed
/// the breaker. Once the circuit opens, the resulting
/// [`CircuitBreakerError::Open`] is returned immediately instead of retried.
pub async fn retry_with_circuit_breaker<T, E, F, Fut>(
    breaker: &CircuitBreaker,
    options: &RetryOptions<E>,
    operation: F,
) -> Result<T, CircuitBreakerError<E>>
where
    E: Classify + 'static,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let options = options.through_breaker();
    let operation = &operation;
    retry(&options, move || breaker.execute(operation)).await
}

/// Fail with a timeout error if `future` does not finish within `duration`.
/// The timeout is classified as transient, so it is retried by default.
pub async fn with_timeout<T, E, Fut>(duration: Duration, future: Fut) -> Result<T, E>
where
    E: From<crate::Error>,
    Fut: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(crate::Error::Timeout(duration).into()),
    }
}
