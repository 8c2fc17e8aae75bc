use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use super::{CLEANUP_INTERVAL, DEFAULT_MAX_KEYS, RateLimitInfo, RateLimitStore, eviction_batch};
use crate::lock;

struct Event {
    at: Instant,
    weight: u64,
}

struct SharedState {
    windows: HashMap<String, VecDeque<Event>>,
    window: Duration,
    limit: u64,
    max_keys: usize,
    next_cleanup: Instant,
}

/// Drop events that have slid out of the window ending at `now`.
fn prune(events: &mut VecDeque<Event>, window: Duration, now: Instant) {
    while events.front().is_some_and(|e| e.at + window <= now) {
        events.pop_front();
    }
}

impl SharedState {
    fn maybe_cleanup(&mut self, now: Instant) {
        if now < self.next_cleanup {
            return;
        }
        let window = self.window;
        self.windows.retain(|_, events| {
            prune(events, window, now);
            !events.is_empty()
        });
        self.next_cleanup = now + CLEANUP_INTERVAL;
    }

    /// Drop the keys whose oldest surviving event is oldest. `keep` is never
    /// evicted.
    fn evict_if_needed(&mut self, keep: &str) {
        let n = eviction_batch(self.max_keys, self.windows.len());
        if n == 0 {
            return;
        }
        let mut by_oldest: Vec<(Option<Instant>, String)> = self
            .windows
            .iter()
            .filter(|(key, _)| key.as_str() != keep)
            .map(|(key, events)| (events.front().map(|e| e.at), key.clone()))
            .collect();
        by_oldest.sort_unstable_by_key(|(oldest, _)| *oldest);
        for (_, key) in by_oldest.into_iter().take(n) {
            self.windows.remove(&key);
        }
    }

    fn increment(&mut self, key: &str, weight: u64, now: Instant) -> RateLimitInfo {
        self.maybe_cleanup(now);

        let window = self.window;
        let events = self.windows.entry(key.to_string()).or_default();
        prune(events, window, now);
        events.push_back(Event { at: now, weight });

        let current = events.iter().map(|e| e.weight).sum();
        let reset_time = events.front().map_or(now, |e| e.at) + window;

        self.evict_if_needed(key);
        RateLimitInfo::new(self.limit, current, reset_time)
    }

    fn decrement(&mut self, key: &str) {
        if let Some(events) = self.windows.get_mut(key) {
            events.pop_back();
        }
    }
}

/// In-memory sliding-window log store backed by a `HashMap`.
///
/// Stores a timestamped event per request. On each increment, events older
/// than the window are drained and `current` is the total weight of the
/// survivors. `reset_time` is when the oldest surviving event leaves the
/// window, which is the earliest moment `current` can drop.
///
/// Unlike [`FixedWindowStore`](super::FixedWindowStore) there is no burst at
/// window boundaries, at the cost of one event per request per key.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct SlidingWindowStore {
    state: Arc<Mutex<SharedState>>,
}

impl SlidingWindowStore {
    pub fn new(window: Duration, limit: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SharedState {
                windows: HashMap::new(),
                window,
                limit,
                max_keys: DEFAULT_MAX_KEYS,
                next_cleanup: Instant::now() + CLEANUP_INTERVAL,
            })),
        }
    }

    /// Hard cap for distinct keys tracked in memory. Defaults to 10,000.
    pub fn max_keys(self, max: usize) -> Self {
        lock(&self.state).max_keys = max.max(1);
        self
    }

    pub fn window(&self) -> Duration {
        lock(&self.state).window
    }

    /// Record an event that counts `weight` times against the limit.
    pub fn increment_by(&self, key: &str, weight: u64) -> RateLimitInfo {
        lock(&self.state).increment(key, weight, Instant::now())
    }

    /// Number of keys currently held, including idle ones not yet purged.
    pub fn tracked_keys(&self) -> usize {
        lock(&self.state).windows.len()
    }
}

impl RateLimitStore for SlidingWindowStore {
    fn increment(&self, key: &str) -> impl Future<Output = RateLimitInfo> + Send {
        std::future::ready(self.increment_by(key, 1))
    }

    fn decrement(&self, key: &str) -> impl Future<Output = ()> + Send {
        lock(&self.state).decrement(key);
        std::future::ready(())
    }

    fn reset(&self, key: &str) -> impl Future<Output = ()> + Send {
        lock(&self.state).windows.remove(key);
        std::future::ready(())
    }

    fn reset_all(&self) -> impl Future<Output = ()> + Send {
        lock(&self.state).windows.clear();
        std::future::ready(())
    }
}
