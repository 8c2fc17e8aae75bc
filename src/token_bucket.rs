//! Token bucket for client-side pacing of outbound calls.

use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::lock;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TokenBucketError {
    #[error("requested {requested} tokens but bucket capacity is {capacity}")]
    ExceedsCapacity { requested: f64, capacity: f64 },
    #[error("bucket is empty and never refills")]
    NoRefill,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
    }
}

/// Continuously refilling token bucket.
///
/// Starts full. Tokens accrue at `refill_rate` per second up to `capacity`;
/// the refill is computed lazily from the time elapsed since the previous
/// call, so an idle bucket costs nothing.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `refill_rate` is in tokens per second.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_rate: refill_rate.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Tokens currently available, after refilling.
    pub fn available(&self) -> f64 {
        let mut state = lock(&self.state);
        state.refill(self.capacity, self.refill_rate, Instant::now());
        state.tokens
    }

    /// Take `n` tokens if they are available right now.
    pub fn try_acquire(&self, n: u32) -> bool {
        self.take_or_wait(f64::from(n)).is_none()
    }

    /// Take `n` tokens, sleeping until enough have accumulated.
    ///
    /// Fails immediately if `n` exceeds the capacity (the bucket could never
    /// hold that many) or if the bucket does not refill.
    pub async fn acquire(&self, n: u32) -> Result<(), TokenBucketError> {
        let requested = f64::from(n);
        if requested > self.capacity {
            return Err(TokenBucketError::ExceedsCapacity {
                requested,
                capacity: self.capacity,
            });
        }
        loop {
            match self.take_or_wait(requested) {
                None => return Ok(()),
                Some(_) if self.refill_rate <= 0.0 => return Err(TokenBucketError::NoRefill),
                Some(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Consume `n` tokens and return `None`, or return how long until `n`
    /// tokens will be available.
    fn take_or_wait(&self, n: f64) -> Option<Duration> {
        let mut state = lock(&self.state);
        state.refill(self.capacity, self.refill_rate, Instant::now());
        if state.tokens >= n {
            state.tokens -= n;
            return None;
        }
        let missing = n - state.tokens;
        if self.refill_rate <= 0.0 {
            return Some(Duration::MAX);
        }
        Some(Duration::from_secs_f64(missing / self.refill_rate))
    }
}
