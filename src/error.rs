//! Hand-rolled error type for the local store, matching the Firestore
//! JS SDK's `code`/`message` pairing rather than a `thiserror` derive tree:
//! callers match on [`FirestoreErrorCode`] and the engine classifies via
//! [`FirestoreErrorCode::kind`] to decide whether to retry, log-and-drop, or
//! propagate a transaction failure to the caller.

use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FirestoreErrorCode {
    InvalidArgument,
    Internal,
    NotFound,
    PermissionDenied,
    Unauthenticated,
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
}

/// How the coordinator should react to an error of a given code. See §7.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transaction conflict; the persistence engine retries automatically.
    /// Never observed by callers of `run_transaction`.
    Retryable,
    /// Assertion or invariant violation; propagated to the caller.
    Fatal,
    /// e.g. rejecting a batch id that doesn't exist.
    NotFound,
    /// A stale remote update; logged and dropped, not surfaced as an error.
    StalenessIgnored,
    /// Sequence-number bookkeeping failed; logged and swallowed.
    TransientBookkeeping,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FirestoreErrorCode::Aborted | FirestoreErrorCode::Unavailable => ErrorKind::Retryable,
            FirestoreErrorCode::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Fatal,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

/// A transaction conflict. The persistence layer retries the transaction body
/// automatically; this should never be observed outside `persistence::`.
pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_retryable_errors() {
        assert_eq!(aborted("conflict").kind(), ErrorKind::Retryable);
        assert_eq!(unavailable("down").kind(), ErrorKind::Retryable);
    }

    #[test]
    fn classifies_not_found() {
        assert_eq!(not_found("no batch").kind(), ErrorKind::NotFound);
    }

    #[test]
    fn classifies_fatal_by_default() {
        assert_eq!(internal_error("bug").kind(), ErrorKind::Fatal);
    }
}
