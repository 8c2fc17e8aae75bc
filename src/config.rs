use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::bulk::BulkOptions;
use crate::circuit_breaker;
use crate::error::{Classify, ConfigError};
use crate::http::HttpService;
use crate::middleware::RateLimit;
use crate::retry::RetryOptions;
use crate::token_bucket::TokenBucket;

/// Top-level configuration. Format-agnostic (TOML, JSON, YAML via serde).
///
/// ```toml
/// [rate_limit]
/// max = 100
/// window = "1m"
///
/// [retry]
/// max_attempts = 4
/// base_delay = "250ms"
///
/// [breakers.payments]
/// threshold = 3
/// reset_timeout = "30s"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct ResilienceConfig {
    /// Fixed-window limiter in front of the handler.
    pub rate_limit: Option<RateLimitConfig>,

    /// Sliding-window limiter in front of the handler. Applied inside
    /// `rate_limit` when both are set.
    pub sliding_window: Option<SlidingWindowConfig>,

    pub token_bucket: Option<TokenBucketConfig>,

    /// Defaults for breakers without their own entry in `breakers`.
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Per-dependency breaker settings, keyed by breaker name.
    #[serde(default)]
    pub breakers: BTreeMap<String, CircuitBreakerConfig>,

    pub retry: Option<RetryConfig>,

    pub bulk: Option<BulkOptions>,
}

/// A single duration, deserialized from a string like `"10s"` or `"200ms"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for DurationValue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(DurationValue)
    }
}

/// Parse `"250ms"`, `"1.5s"`, `"15m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (number, unit_secs) = if let Some(ms) = s.strip_suffix("ms") {
        let n: u64 = ms.parse().map_err(|e| format!("invalid duration: {e}"))?;
        return Ok(Duration::from_millis(n));
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1.0)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60.0)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600.0)
    } else {
        return Err(format!(
            "expected duration like '200ms', '1s', '15m' or '1h', got '{s}'"
        ));
    };
    let n: f64 = number.parse().map_err(|e| format!("invalid duration: {e}"))?;
    Duration::try_from_secs_f64(n * unit_secs).map_err(|e| format!("invalid duration: {e}"))
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub max: u64,
    pub window: DurationValue,
    pub max_keys: Option<usize>,
    pub message: Option<String>,
    #[serde(default = "yes")]
    pub standard_headers: bool,
    #[serde(default)]
    pub legacy_headers: bool,
    #[serde(default)]
    pub skip_successful_requests: bool,
    #[serde(default)]
    pub skip_failed_requests: bool,
}

/// Same fields as [`RateLimitConfig`], counted over a sliding window.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct SlidingWindowConfig(pub RateLimitConfig);

#[derive(Debug, Clone, Deserialize)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    /// Tokens per second.
    pub refill_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    pub threshold: Option<u32>,
    pub reset_timeout: Option<DurationValue>,
    pub success_threshold: Option<u32>,
    pub half_open_probes: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub base_delay: Option<DurationValue>,
    pub max_delay: Option<DurationValue>,
    pub backoff_factor: Option<f64>,
    pub jitter: Option<bool>,
}

impl ResilienceConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section without building anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(rl) = &self.rate_limit {
            rl.validate()?;
        }
        if let Some(sw) = &self.sliding_window {
            sw.0.validate()?;
        }
        if let Some(tb) = &self.token_bucket {
            tb.validate()?;
        }
        if let Some(cb) = &self.circuit_breaker {
            cb.to_runtime()?;
        }
        for cb in self.breakers.values() {
            cb.to_runtime()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(bulk) = &self.bulk
            && bulk.concurrency == 0
        {
            return Err(ConfigError::invalid("bulk.concurrency", "must be at least 1"));
        }
        Ok(())
    }

    /// Wrap `inner` in the configured limiters. With both sections present
    /// the fixed window is outermost.
    pub fn apply_rate_limits(&self, mut inner: HttpService) -> Result<HttpService, ConfigError> {
        if let Some(sw) = &self.sliding_window {
            inner = crate::http::boxed(tower::Layer::layer(&sw.build()?, inner));
        }
        if let Some(rl) = &self.rate_limit {
            inner = crate::http::boxed(tower::Layer::layer(&rl.build()?, inner));
        }
        Ok(inner)
    }

    /// Breaker settings for `name`: its own entry, else the
    /// `circuit_breaker` section, else the defaults.
    pub fn breaker_config(
        &self,
        name: &str,
    ) -> Result<circuit_breaker::CircuitBreakerConfig, ConfigError> {
        match self.breakers.get(name).or(self.circuit_breaker.as_ref()) {
            Some(cb) => cb.to_runtime(),
            None => Ok(circuit_breaker::CircuitBreakerConfig::default()),
        }
    }

    pub fn retry_options<E: Classify + 'static>(
        &self,
    ) -> Result<RetryOptions<E>, ConfigError> {
        self.retry.clone().unwrap_or_default().build()
    }
}

impl RateLimitConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.window.0.is_zero() {
            return Err(ConfigError::invalid("rate_limit.window", "must be positive"));
        }
        if self.max_keys == Some(0) {
            return Err(ConfigError::invalid("rate_limit.max_keys", "must be at least 1"));
        }
        Ok(())
    }

    fn configure<S: crate::store::RateLimitStore>(&self, limiter: RateLimit<S>) -> RateLimit<S> {
        let limiter = limiter
            .standard_headers(self.standard_headers)
            .legacy_headers(self.legacy_headers)
            .skip_successful_requests(self.skip_successful_requests)
            .skip_failed_requests(self.skip_failed_requests);
        match &self.message {
            Some(message) => limiter.message(message.as_str()),
            None => limiter,
        }
    }

    /// Build a fixed-window [`RateLimit`] keyed by client address.
    pub fn build(&self) -> Result<RateLimit, ConfigError> {
        self.validate()?;
        let mut store = crate::store::FixedWindowStore::new(self.window.0, self.max);
        if let Some(max_keys) = self.max_keys {
            store = store.max_keys(max_keys);
        }
        Ok(self.configure(RateLimit::with_store(store, self.max)))
    }
}

impl SlidingWindowConfig {
    /// Build a sliding-window [`RateLimit`] keyed by client address.
    pub fn build(&self) -> Result<RateLimit<crate::store::SlidingWindowStore>, ConfigError> {
        let config = &self.0;
        config.validate()?;
        let mut store = crate::store::SlidingWindowStore::new(config.window.0, config.max);
        if let Some(max_keys) = config.max_keys {
            store = store.max_keys(max_keys);
        }
        Ok(config.configure(RateLimit::with_store(store, config.max)))
    }
}

impl TokenBucketConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::invalid("token_bucket.capacity", "must be at least 1"));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(ConfigError::invalid(
                "token_bucket.refill_rate",
                format!("must be a non-negative number, got {}", self.refill_rate),
            ));
        }
        Ok(())
    }

    pub fn build(&self) -> Result<TokenBucket, ConfigError> {
        self.validate()?;
        Ok(TokenBucket::new(self.capacity, self.refill_rate))
    }
}

impl CircuitBreakerConfig {
    /// Runtime settings, with unset fields taken from the defaults.
    pub fn to_runtime(&self) -> Result<circuit_breaker::CircuitBreakerConfig, ConfigError> {
        let defaults = circuit_breaker::CircuitBreakerConfig::default();
        let config = circuit_breaker::CircuitBreakerConfig {
            failure_threshold: self.threshold.unwrap_or(defaults.failure_threshold),
            reset_timeout: self.reset_timeout.map_or(defaults.reset_timeout, |d| d.0),
            success_threshold: self.success_threshold.unwrap_or(defaults.success_threshold),
            half_open_probes: self.half_open_probes.unwrap_or(defaults.half_open_probes),
        };
        if config.failure_threshold == 0 {
            return Err(ConfigError::invalid("circuit_breaker.threshold", "must be at least 1"));
        }
        if config.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.success_threshold",
                "must be at least 1",
            ));
        }
        if config.half_open_probes == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.half_open_probes",
                "must be at least 1",
            ));
        }
        Ok(config)
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == Some(0) {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if let Some(factor) = self.backoff_factor
            && (!factor.is_finite() || factor < 1.0)
        {
            return Err(ConfigError::invalid(
                "retry.backoff_factor",
                format!("must be at least 1.0, got {factor}"),
            ));
        }
        if let (Some(base), Some(max)) = (self.base_delay, self.max_delay)
            && base.0 > max.0
        {
            return Err(ConfigError::invalid(
                "retry.base_delay",
                "must not exceed retry.max_delay",
            ));
        }
        Ok(())
    }

    /// Retry options with the default transient-failure condition.
    pub fn build<E: Classify + 'static>(&self) -> Result<RetryOptions<E>, ConfigError> {
        self.validate()?;
        let mut options = RetryOptions::default();
        if let Some(n) = self.max_attempts {
            options = options.max_attempts(n);
        }
        if let Some(d) = self.base_delay {
            options = options.base_delay(d.0);
        }
        if let Some(d) = self.max_delay {
            options = options.max_delay(d.0);
        }
        if let Some(f) = self.backoff_factor {
            options = options.backoff_factor(f);
        }
        if let Some(j) = self.jitter {
            options = options.jitter(j);
        }
        Ok(options)
    }
}
