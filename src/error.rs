use std::borrow::Cow;
use std::fmt;
use std::io;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Failure classification shared by the retry predicates and the circuit
/// breaker integration.
///
/// `is_transient` answers "could the same call succeed if repeated later",
/// which is what the default retry condition consults. `code` is a short,
/// stable identifier recorded as `error_code` in retry log events.
pub trait Classify: fmt::Display {
    fn is_transient(&self) -> bool;

    /// Whether this failure is a circuit-open rejection. These are never
    /// retried.
    fn is_circuit_open(&self) -> bool {
        false
    }

    fn code(&self) -> Cow<'_, str>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseErrorKind {
    /// Could not reach the database server.
    Connection,
    /// The server did not answer in time.
    Timeout,
    /// Write conflict or deadlock; the transaction can be replayed.
    TransactionConflict,
    /// Unique, foreign-key or check constraint violated.
    Constraint,
    Other,
}

impl fmt::Display for DatabaseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::TransactionConflict => "transaction conflict",
            Self::Constraint => "constraint",
            Self::Other => "query",
        };
        f.write_str(s)
    }
}

/// Failure of a call to a downstream dependency.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream responded with {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("database {kind} error: {message}")]
    Database {
        kind: DatabaseErrorKind,
        message: String,
    },

    #[error("i/o error: {message}")]
    Io {
        kind: io::ErrorKind,
        message: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn database(kind: DatabaseErrorKind, message: impl Into<String>) -> Self {
        Self::Database {
            kind,
            message: message.into(),
        }
    }

    /// Whether this failure can be retried. Shorthand for
    /// [`Classify::is_transient`].
    pub fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    /// HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

fn io_kind_is_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

impl Classify for Error {
    fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => status.is_server_error(),
            Self::Database { kind, .. } => matches!(
                kind,
                DatabaseErrorKind::Connection | DatabaseErrorKind::Timeout
            ),
            Self::Io { kind, .. } => io_kind_is_transient(*kind),
            Self::Validation(_) | Self::Other(_) => false,
        }
    }

    fn code(&self) -> Cow<'_, str> {
        let code = match self {
            Self::Network(_) => "NETWORK_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Status { status, .. } => return Cow::Owned(format!("HTTP_{}", status.as_u16())),
            Self::Database { kind, .. } => match kind {
                DatabaseErrorKind::Connection => "DB_CONNECTION",
                DatabaseErrorKind::Timeout => "DB_TIMEOUT",
                DatabaseErrorKind::TransactionConflict => "DB_TRANSACTION_CONFLICT",
                DatabaseErrorKind::Constraint => "DB_CONSTRAINT",
                DatabaseErrorKind::Other => "DB_ERROR",
            },
            Self::Io { .. } => "IO_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Other(_) => "UNKNOWN_ERROR",
        };
        Cow::Borrowed(code)
    }
}

impl Classify for io::Error {
    fn is_transient(&self) -> bool {
        io_kind_is_transient(self.kind())
    }

    fn code(&self) -> Cow<'_, str> {
        Cow::Owned(format!("{:?}", self.kind()))
    }
}

/// Invalid configuration value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
