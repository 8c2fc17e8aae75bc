//! Bulk retry executor.
//!
//! [`retry_bulk`] runs one operation per item with bounded concurrency,
//! optionally retrying each item on its own, and collects successes and
//! per-item failures separately.

use std::fmt;
use std::future::Future;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Deserialize;

use crate::error::Classify;
use crate::retry::{RetryOptions, retry};

/// Counting semaphore with FIFO hand-off.
///
/// Permits are released by dropping the guard returned from
/// [`acquire`](Self::acquire), so a slot is freed on success, failure and
/// cancellation alike. A released permit goes to the longest-waiting
/// acquirer.
pub struct Semaphore {
    inner: tokio::sync::Semaphore,
    permits: usize,
}

/// A held semaphore slot.
pub struct Permit<'a> {
    _permit: tokio::sync::SemaphorePermit<'a>,
}

impl Semaphore {
    /// A semaphore with `permits` slots. Zero is treated as one.
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            inner: tokio::sync::Semaphore::new(permits),
            permits,
        }
    }

    /// Wait until a slot is free and take it.
    pub async fn acquire(&self) -> Permit<'_> {
        // `inner` is private and never closed, so acquiring cannot fail.
        let permit = self
            .inner
            .acquire()
            .await
            .expect("bulk semaphore is never closed");
        Permit { _permit: permit }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        self.inner
            .try_acquire()
            .ok()
            .map(|permit| Permit { _permit: permit })
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.permits - self.inner.available_permits()
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.permits)
            .field("available", &self.available_permits())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BulkOptions {
    /// Attempts per item when `retry_individual_items` is set.
    pub max_attempts: u32,
    /// Items processed at the same time.
    pub concurrency: usize,
    /// Collect failures and keep going instead of returning the first one.
    pub continue_on_error: bool,
    /// Run each item through the retry engine.
    pub retry_individual_items: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            concurrency: 5,
            continue_on_error: true,
            retry_individual_items: true,
        }
    }
}

/// An item whose operation failed, with the last error it produced.
#[derive(Debug)]
pub struct BulkFailure<I, E> {
    pub item: I,
    pub error: E,
}

/// Results of a bulk run. Both lists keep the input order of their items.
#[derive(Debug)]
pub struct BulkOutcome<I, T, E> {
    pub results: Vec<T>,
    pub errors: Vec<BulkFailure<I, E>>,
}

impl<I, T, E> BulkOutcome<I, T, E> {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run `operation` once per item, at most `options.concurrency` at a time.
///
/// Each item is retried with the default transient-failure condition and
/// `options.max_attempts` attempts, unless `retry_individual_items` is off.
/// With `continue_on_error` off, the first failure is returned as `Err` and
/// the items still in flight are cancelled.
pub async fn retry_bulk<I, T, E, F, Fut>(
    items: Vec<I>,
    operation: F,
    options: &BulkOptions,
) -> Result<BulkOutcome<I, T, E>, E>
where
    E: Classify + 'static,
    F: Fn(&I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let retry_options = RetryOptions::<E>::default()
        .max_attempts(options.max_attempts)
        .label("bulk");
    retry_bulk_with(items, operation, options, &retry_options).await
}

/// [`retry_bulk`] with a caller-supplied retry schedule and condition.
/// `options.max_attempts` is ignored in favour of `retry_options`.
pub async fn retry_bulk_with<I, T, E, F, Fut>(
    items: Vec<I>,
    operation: F,
    options: &BulkOptions,
    retry_options: &RetryOptions<E>,
) -> Result<BulkOutcome<I, T, E>, E>
where
    E: Classify + 'static,
    F: Fn(&I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let total = items.len();
    let semaphore = Semaphore::new(options.concurrency);
    let retry_each = options.retry_individual_items;

    let (semaphore, operation) = (&semaphore, &operation);
    let mut pending: FuturesUnordered<_> = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| async move {
            let _permit = semaphore.acquire().await;
            let result = if retry_each {
                retry(retry_options, || operation(&item)).await
            } else {
                operation(&item).await
            };
            (index, item, result)
        })
        .collect();

    let mut slots: Vec<Option<(I, Result<T, E>)>> = (0..total).map(|_| None).collect();
    while let Some((index, item, result)) = pending.next().await {
        match result {
            Err(error) if !options.continue_on_error => {
                tracing::warn!(
                    index,
                    error_code = %error.code(),
                    error = %error,
                    "bulk operation aborted"
                );
                return Err(error);
            }
            result => slots[index] = Some((item, result)),
        }
    }

    let mut outcome = BulkOutcome {
        results: Vec::with_capacity(total),
        errors: Vec::new(),
    };
    for (item, result) in slots.into_iter().flatten() {
        match result {
            Ok(value) => outcome.results.push(value),
            Err(error) => outcome.errors.push(BulkFailure { item, error }),
        }
    }

    tracing::debug!(
        total,
        succeeded = outcome.results.len(),
        failed = outcome.errors.len(),
        "bulk operation finished"
    );
    Ok(outcome)
}
