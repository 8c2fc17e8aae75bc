//! Per-key request counters backing the rate-limit middleware.
//!
//! Two in-process implementations are provided:
//!
//! - [`FixedWindowStore`] counts requests in consecutive, non-overlapping
//!   windows. Cheap (one counter per key) but allows up to twice the limit
//!   across a window boundary.
//! - [`SlidingWindowStore`] keeps a log of recent events per key and counts
//!   those younger than the window, so there is no boundary burst.
//!
//! Both bound memory the same way: expired keys are purged opportunistically
//! during increments (no background task), and once the number of tracked
//! keys exceeds a hard cap the entries closest to expiry are evicted first.

mod fixed_window;
mod sliding_window;

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

pub use fixed_window::FixedWindowStore;
pub use sliding_window::SlidingWindowStore;

pub(crate) const DEFAULT_MAX_KEYS: usize = 10_000;
pub(crate) const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Snapshot of a key's usage, produced by every increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Configured ceiling.
    pub limit: u64,
    /// Requests counted in the active window, including this one.
    pub current: u64,
    /// `max(0, limit - current)`.
    pub remaining: u64,
    /// When the active window stops counting the oldest request.
    pub reset_time: Instant,
}

impl RateLimitInfo {
    pub fn new(limit: u64, current: u64, reset_time: Instant) -> Self {
        Self {
            limit,
            current,
            remaining: limit.saturating_sub(current),
            reset_time,
        }
    }

    /// Re-evaluate against another ceiling. `remaining` is recomputed.
    pub fn with_limit(self, limit: u64) -> Self {
        Self::new(limit, self.current, self.reset_time)
    }

    pub fn is_exceeded(&self) -> bool {
        self.current > self.limit
    }

    /// Time left until [`reset_time`](Self::reset_time), zero if already past.
    pub fn reset_after(&self) -> Duration {
        self.reset_time.saturating_duration_since(Instant::now())
    }
}

/// Backend storage for request counters.
///
/// The window length and limit are given to the store at construction time.
/// Implementations must linearize increments for the same key: two
/// concurrent increments always observe distinct `current` values.
pub trait RateLimitStore: Send + Sync + Clone + 'static {
    /// Count one request for `key` and report the key's usage.
    fn increment(&self, key: &str) -> impl Future<Output = RateLimitInfo> + Send;

    /// Un-count the most recent request for `key`, if any.
    fn decrement(&self, key: &str) -> impl Future<Output = ()> + Send;

    /// Forget everything about `key`.
    fn reset(&self, key: &str) -> impl Future<Output = ()> + Send;

    /// Forget every key.
    fn reset_all(&self) -> impl Future<Output = ()> + Send;
}

/// Number of entries to drop once the population cap is exceeded. Evicting
/// a tenth of the cap at once keeps the sort amortized over many inserts.
pub(crate) fn eviction_batch(max_keys: usize, len: usize) -> usize {
    let excess = len.saturating_sub(max_keys);
    if excess == 0 {
        return 0;
    }
    excess.max((max_keys / 10).max(1))
}
