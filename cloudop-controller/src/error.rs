//! Controller error taxonomy.

use std::fmt;

use cloudop_api::{ObjectRef, StoreError};
use thiserror::Error;

use crate::batch::BatchSummary;
use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum Error {
    /// The resource or object is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Concurrent modification or propagation delay; retry later.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Credentials could not be bound for the object's scope.
    #[error("authorization failed for {scope}: {message}")]
    Authorization { scope: String, message: String },

    /// Any other provider failure during ensure or delete.
    #[error("provider operation failed: {0}")]
    Provider(#[source] ProviderError),

    /// Dispatch wiring error: a client received an object it cannot handle.
    #[error("type mismatch for {kind}: {message}")]
    TypeMismatch { kind: String, message: String },

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("gave up after {attempts} attempts")]
    Timeout { attempts: usize },

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error("{0}")]
    Aggregate(AggregateError),

    #[error("{} of {total} objects failed, first: {}", .failures.len(), first_failure(.failures))]
    Batch {
        total: usize,
        failures: Vec<(ObjectRef, Error)>,
        /// Objects that were applied or skipped.
        summary: BatchSummary,
    },
}

fn first_failure(failures: &[(ObjectRef, Error)]) -> String {
    failures
        .first()
        .map(|(r, e)| format!("{}: {}", r, e))
        .unwrap_or_default()
}

impl Error {
    pub fn type_mismatch(kind: &str, message: impl fmt::Display) -> Self {
        Error::TypeMismatch {
            kind: kind.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Store(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Errors worth retrying without any change on our side.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Store(e) => e.is_conflict(),
            Error::Provider(e) => e.is_transient(),
            Error::Aggregate(agg) => agg.0.iter().all(Error::is_transient),
            _ => false,
        }
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, Error::Authorization { .. })
    }
}

impl From<ProviderError> for Error {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotFound(msg) => Error::NotFound(msg),
            ProviderError::Conflict(msg) => Error::Conflict(msg),
            ProviderError::Unauthorized { scope, message } => {
                Error::Authorization { scope, message }
            }
            other => Error::Provider(other),
        }
    }
}

/// Several errors from a single reconcile attempt.
#[derive(Debug)]
pub struct AggregateError(pub Vec<Error>);

impl AggregateError {
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
