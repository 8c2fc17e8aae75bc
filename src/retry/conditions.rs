//! Retry predicates and preset option sets for common dependencies.

use std::io;
use std::time::Duration;

use http::StatusCode;

use super::RetryOptions;
use crate::error::{Classify, DatabaseErrorKind, Error};

/// Retry transient failures, never circuit-open rejections.
pub fn default_condition<E: Classify>(error: &E) -> bool {
    !error.is_circuit_open() && error.is_transient()
}

/// Connection loss, timeouts and transaction conflicts.
pub fn database_condition(error: &Error) -> bool {
    match error {
        Error::Database { kind, .. } => matches!(
            kind,
            DatabaseErrorKind::Connection
                | DatabaseErrorKind::Timeout
                | DatabaseErrorKind::TransactionConflict
        ),
        Error::Network(_) | Error::Timeout(_) => true,
        _ => false,
    }
}

/// Network failures, 5xx responses and 429.
pub fn http_condition(error: &Error) -> bool {
    match error {
        Error::Network(_) | Error::Timeout(_) => true,
        Error::Status { status, .. } => {
            status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
        }
        _ => false,
    }
}

#[cfg(unix)]
const RETRYABLE_ERRNO: &[i32] = &[
    16, // EBUSY
    23, // ENFILE
    24, // EMFILE
];

#[cfg(not(unix))]
const RETRYABLE_ERRNO: &[i32] = &[];

/// Busy files, descriptor exhaustion, and paths that may appear or become
/// accessible shortly.
pub fn file_condition(error: &io::Error) -> bool {
    if let Some(code) = error.raw_os_error()
        && RETRYABLE_ERRNO.contains(&code)
    {
        return true;
    }
    matches!(
        error.kind(),
        io::ErrorKind::ResourceBusy | io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    )
}

impl RetryOptions<Error> {
    /// 3 attempts, 1s base delay growing by 1.5x.
    pub fn database() -> Self {
        Self::new(database_condition)
            .label("database")
            .backoff_factor(1.5)
    }

    /// 3 attempts, 1s base delay doubling.
    pub fn http() -> Self {
        Self::new(http_condition).label("http")
    }
}

impl RetryOptions<io::Error> {
    /// 5 attempts, 500ms base delay growing by 1.2x.
    pub fn file() -> Self {
        Self::new(file_condition)
            .label("file")
            .max_attempts(5)
            .base_delay(Duration::from_millis(500))
            .backoff_factor(1.2)
    }
}
