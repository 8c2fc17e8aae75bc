use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use super::{CLEANUP_INTERVAL, DEFAULT_MAX_KEYS, RateLimitInfo, RateLimitStore, eviction_batch};
use crate::lock;

struct Entry {
    count: u64,
    expires_at: Instant,
}

struct SharedState {
    entries: HashMap<String, Entry>,
    window: Duration,
    limit: u64,
    max_keys: usize,
    next_cleanup: Instant,
}

impl SharedState {
    fn maybe_cleanup(&mut self, now: Instant) {
        if now < self.next_cleanup {
            return;
        }
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.next_cleanup = now + CLEANUP_INTERVAL;
    }

    /// Drop the entries whose windows end soonest until the map is back
    /// under the cap. `keep` is never evicted.
    fn evict_if_needed(&mut self, keep: &str) {
        let n = eviction_batch(self.max_keys, self.entries.len());
        if n == 0 {
            return;
        }
        let mut by_expiry: Vec<(Instant, String)> = self
            .entries
            .iter()
            .filter(|(key, _)| key.as_str() != keep)
            .map(|(key, entry)| (entry.expires_at, key.clone()))
            .collect();
        by_expiry.sort_unstable_by_key(|(expires_at, _)| *expires_at);
        for (_, key) in by_expiry.into_iter().take(n) {
            self.entries.remove(&key);
        }
    }

    fn increment(&mut self, key: &str, now: Instant) -> RateLimitInfo {
        self.maybe_cleanup(now);

        let window = self.window;
        let entry = self.entries.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at: now + window,
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + window;
        }
        entry.count += 1;
        let (count, expires_at) = (entry.count, entry.expires_at);

        self.evict_if_needed(key);
        RateLimitInfo::new(self.limit, count, expires_at)
    }

    fn decrement(&mut self, key: &str, now: Instant) {
        if let Some(entry) = self.entries.get_mut(key)
            && entry.expires_at > now
        {
            entry.count = entry.count.saturating_sub(1);
        }
    }
}

/// In-memory fixed-window counter store backed by a `HashMap`.
///
/// The first request for a key opens a window of the configured length;
/// every request inside it increments one counter. The next request after
/// the window ends starts over at 1.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct FixedWindowStore {
    state: Arc<Mutex<SharedState>>,
}

impl FixedWindowStore {
    pub fn new(window: Duration, limit: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SharedState {
                entries: HashMap::new(),
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

    /// Number of keys currently held, including expired ones not yet purged.
    pub fn tracked_keys(&self) -> usize {
        lock(&self.state).entries.len()
    }
}

impl RateLimitStore for FixedWindowStore {
    fn increment(&self, key: &str) -> impl Future<Output = RateLimitInfo> + Send {
        let info = lock(&self.state).increment(key, Instant::now());
        std::future::ready(info)
    }

    fn decrement(&self, key: &str) -> impl Future<Output = ()> + Send {
        lock(&self.state).decrement(key, Instant::now());
        std::future::ready(())
    }

    fn reset(&self, key: &str) -> impl Future<Output = ()> + Send {
        lock(&self.state).entries.remove(key);
        std::future::ready(())
    }

    fn reset_all(&self) -> impl Future<Output = ()> + Send {
        lock(&self.state).entries.clear();
        std::future::ready(())
    }
}
