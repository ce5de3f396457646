//! # Status Values
//!
//! Every fallible operation in tidepool returns [`Result<T>`] carrying an
//! [`Error`] with a matchable [`ErrorKind`]. Errors are ordinary values:
//! nothing in the library panics or unwinds across the public surface, and
//! cleanup paths that can fail more than once fold their failures into a
//! single status with [`accumulate`].
//!
//! ## Kind Selection
//!
//! - `Precondition`: the object is in the wrong state for the call
//!   (unopened file, read-only handle, poisoned mapping).
//! - `InvalidArgument`: the caller passed something unusable (a counter
//!   value that is not 8 bytes, a zero worker count).
//! - `Infeasible`: the state is valid but the request cannot be satisfied
//!   (read past end, compare-exchange mismatch, shrinking past the map).
//! - `NotFound`: a record or file is absent, including iterators
//!   invalidated by a generation change.
//! - `System`: a wrapped OS error, tagged with the syscall name.
//!
//! OS errors are classified by errno so that callers can match on the kind
//! instead of parsing messages.

use std::fmt;
use std::io;

/// Classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unclassified failure.
    Unknown,
    /// Wrapped operating-system error.
    System,
    /// The operation is not supported by this implementation.
    NotImplemented,
    /// The object is in the wrong state for the operation.
    Precondition,
    /// A caller-supplied argument is unusable.
    InvalidArgument,
    /// The task was dropped before it could run.
    Cancelled,
    /// The requested record or file does not exist.
    NotFound,
    /// The operating system denied access.
    Permission,
    /// The request cannot be satisfied in the current state.
    Infeasible,
    /// The record already exists.
    Duplication,
    /// Stored data failed validation.
    BrokenData,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unknown => "unknown error",
            ErrorKind::System => "system error",
            ErrorKind::NotImplemented => "not implemented",
            ErrorKind::Precondition => "precondition error",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NotFound => "not found",
            ErrorKind::Permission => "permission error",
            ErrorKind::Infeasible => "infeasible error",
            ErrorKind::Duplication => "duplication error",
            ErrorKind::BrokenData => "broken data",
        };
        f.write_str(name)
    }
}

/// A status value: a kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Precondition, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn infeasible(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Infeasible, message)
    }

    pub fn not_implemented() -> Self {
        Self::new(ErrorKind::NotImplemented, "not supported by this database")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn duplication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Duplication, message)
    }

    pub fn broken_data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BrokenData, message)
    }

    /// Wraps an OS error from `call`, classifying the errno.
    pub fn sys(call: &str, err: io::Error) -> Self {
        let kind = match err.raw_os_error() {
            Some(libc::ENOENT) | Some(libc::ENOTDIR) => ErrorKind::NotFound,
            Some(libc::EACCES) | Some(libc::EPERM) => ErrorKind::Permission,
            Some(libc::EEXIST) => ErrorKind::Duplication,
            Some(libc::ENOSPC)
            | Some(libc::ENOMEM)
            | Some(libc::EFBIG)
            | Some(libc::EMFILE)
            | Some(libc::ENFILE)
            | Some(libc::ENAMETOOLONG)
            | Some(libc::EOVERFLOW)
            | Some(libc::EISDIR)
            | Some(libc::ELOOP)
            | Some(libc::ENOTEMPTY)
            | Some(libc::ETXTBSY)
            | Some(libc::EXDEV) => ErrorKind::Infeasible,
            _ => ErrorKind::System,
        };
        Self::new(kind, format!("{call}: {err}"))
    }
}

/// Folds a cleanup failure into an accumulator status.
///
/// The first failing kind wins; later messages are appended so nothing is
/// silently lost when a multi-step teardown fails more than once.
pub fn accumulate(acc: &mut Result<()>, next: Result<()>) {
    if let Err(e) = next {
        match acc {
            Ok(()) => *acc = Err(e),
            Err(first) => {
                first.message.push_str("; ");
                first.message.push_str(&e.message);
            }
        }
    }
}
