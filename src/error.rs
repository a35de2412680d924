//! Contains the `Error` and `Result` types that `hasql` uses.

use thiserror::Error;

/// The result type for all methods that can return an error in the `hasql` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `hasql` crate. The inner
/// [`ErrorKind`](enum.ErrorKind.html) is boxed to keep the type small enough
/// to pass through `Result`s cheaply.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
        }
    }

    /// Creates an error for an invalid argument combination or value.
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument {
            message: message.into(),
        })
    }

    /// Creates an error for a connection string that could not be parsed.
    pub(crate) fn invalid_dsn(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidDsn {
            message: message.into(),
        })
    }

    /// Creates an error representing an exceeded time budget.
    pub(crate) fn timed_out(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout {
            message: message.into(),
        })
    }

    /// Creates an error originating in the driver adapter.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Driver {
            message: message.into(),
        })
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal {
            message: message.into(),
        })
    }

    /// Whether this error was caused by an exceeded time budget.
    pub fn is_timeout(&self) -> bool {
        matches!(*self.kind, ErrorKind::Timeout { .. })
    }

    /// Whether this error was caused by an invalid argument or argument
    /// combination.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::InvalidArgument { .. } | ErrorKind::InvalidDsn { .. }
        )
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A connection string could not be parsed.
    #[error("invalid connection string: {message}")]
    InvalidDsn { message: String },

    /// An operation exceeded its time budget.
    #[error("operation timed out: {message}")]
    Timeout { message: String },

    /// The driver adapter reported a failure.
    #[error("driver error: {message}")]
    Driver { message: String },

    /// The pool manager reached an unexpected state.
    #[error("internal error: {message}")]
    Internal { message: String },
}
