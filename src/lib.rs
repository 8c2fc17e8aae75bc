//! Request rate limiting, circuit breaking and retries for services built on
//! `tower` and `http`.
//!
//! - [`middleware`] has tower layers that answer over-limit callers with
//!   `429 Too Many Requests`, backed by the counter stores in [`store`].
//! - [`CircuitBreaker`] stops calls to a failing dependency and probes it
//!   after a cooldown.
//! - [`retry`] re-runs failed operations with exponential backoff, on its
//!   own or through a breaker.
//! - [`bulk`] fans an operation out over many items with bounded
//!   concurrency.
//! - [`TokenBucket`] paces outbound calls.

pub mod bulk;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod http;
pub mod middleware;
pub mod retry;
pub mod store;
pub mod token_bucket;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry, CircuitState,
};
pub use config::ResilienceConfig;
pub use error::{Classify, ConfigError, DatabaseErrorKind, Error};
pub use retry::{RetryAttempt, RetryOptions, retry, retry_with_circuit_breaker, with_timeout};
pub use store::{FixedWindowStore, RateLimitInfo, RateLimitStore, SlidingWindowStore};
pub use token_bucket::{TokenBucket, TokenBucketError};

/// Lock a mutex, recovering the data if a previous holder panicked. Every
/// critical section in this crate leaves its state consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Breaker name used by [`Resilience::retry_external_api_call`].
pub fn external_api_breaker_name(service: &str) -> String {
    format!("external-api-{service}")
}

/// Shared resilience state for an application: the breaker registry and
/// the configuration new breakers are created from.
///
/// Cloning is cheap and clones share breakers.
#[derive(Clone, Default)]
pub struct Resilience {
    breakers: CircuitBreakerRegistry,
    config: Arc<ResilienceConfig>,
}

impl Resilience {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create breakers from `config` instead of the defaults.
    pub fn from_config(config: ResilienceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            breakers: CircuitBreakerRegistry::new(),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// The breaker named `name`, created from the configuration if needed.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let config = self.config.breaker_config(name).unwrap_or_default();
        self.breakers.get_or_create(name, &config)
    }

    /// Retry `operation` through the breaker named `name`, creating it with
    /// `breaker_config` if it does not exist yet.
    pub async fn retry_with_circuit_breaker<T, E, F, Fut>(
        &self,
        name: &str,
        options: &RetryOptions<E>,
        breaker_config: &CircuitBreakerConfig,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        E: Classify + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breakers.get_or_create(name, breaker_config);
        retry::retry_with_circuit_breaker(&breaker, options, operation).await
    }

    /// Call a third-party API through the breaker `external-api-<service>`
    /// (5 failures trip it, 30s cooldown), with 3 attempts starting at 2s
    /// and capped at 10s.
    pub async fn retry_external_api_call<T, E, F, Fut>(
        &self,
        service: &str,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        E: Classify + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let options = RetryOptions::default()
            .label(external_api_breaker_name(service))
            .base_delay(Duration::from_secs(2))
            .max_delay(Duration::from_secs(10));
        self.retry_external_api_call_with(service, &options, operation)
            .await
    }

    /// [`retry_external_api_call`](Self::retry_external_api_call) with a
    /// caller-supplied retry schedule.
    pub async fn retry_external_api_call_with<T, E, F, Fut>(
        &self,
        service: &str,
        options: &RetryOptions<E>,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        E: Classify + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker_config = CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let name = external_api_breaker_name(service);
        self.retry_with_circuit_breaker(&name, options, &breaker_config, operation)
            .await
    }
}
