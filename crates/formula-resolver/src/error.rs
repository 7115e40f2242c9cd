use crate::collaborator::CollaboratorError;
use crate::manifest::ManifestError;
use formula_storage::StorageError;
use thiserror::Error;

/// Terminal outcomes of a resolve.
///
/// Only these two conditions may settle a waiter with a failure. Cache misses,
/// in-progress preloads and timeouts are not errors; they always end in a
/// fetch that produces a real value (or one of these).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

impl ResolveError {
    pub fn sentinel(&self) -> ErrorSentinel {
        match self {
            ResolveError::InvalidParameters(_) => ErrorSentinel::InvalidValue,
            ResolveError::Collaborator(_) => ErrorSentinel::ServiceError,
        }
    }
}

/// Error marker rendered in the cell instead of a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSentinel {
    /// `#VALUE!`: the formula's arguments cannot be resolved.
    InvalidValue,
    /// `#ERROR!`: the ledger service reported a failure.
    ServiceError,
}

impl ErrorSentinel {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorSentinel::InvalidValue => "#VALUE!",
            ErrorSentinel::ServiceError => "#ERROR!",
        }
    }
}

/// What the host renders for one formula invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellOutcome {
    Value(f64),
    Error(ErrorSentinel),
}

impl From<Result<f64>> for CellOutcome {
    fn from(result: Result<f64>) -> Self {
        match result {
            Ok(value) => CellOutcome::Value(value),
            Err(err) => CellOutcome::Error(err.sentinel()),
        }
    }
}

/// Failures of explicit maintenance actions (invalidation, clear).
#[derive(Debug, Error)]
pub enum InvalidationError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}
