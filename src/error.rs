use std::sync::Arc;

use crate::experiment::ExperimentStatus;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while assigning variants or managing experiments.
///
/// Non-assignment outcomes (test inactive, user not eligible, user outside the allocation band)
/// are *not* errors. They are reported through [`Decision`](crate::Decision) and fold into a
/// `None` variant. Only malformed input and infrastructure failures surface here.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Request input is malformed (empty ids, oversized ids, unparseable body).
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Experiment definition violates a structural constraint.
    #[error("invalid experiment definition: {0}")]
    InvalidExperiment(String),

    /// An administrative operation referenced an unknown experiment.
    #[error("experiment {0:?} not found")]
    ExperimentNotFound(String),

    /// Lifecycle transition is not allowed.
    #[error("cannot move experiment from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current status.
        from: ExperimentStatus,
        /// Requested status.
        to: ExperimentStatus,
    },

    /// Completed and archived experiments are read-only.
    #[error("experiment {0:?} is read-only")]
    ExperimentReadOnly(String),

    /// Assignment storage is temporarily unavailable. Retried with backoff before surfacing.
    #[error("assignment storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Permanent assignment storage failure (corrupt row, schema mismatch, ...).
    #[error("assignment storage error: {0}")]
    Storage(String),

    /// Invalid base URL for the remote experiment source.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The remote experiment source rejected our credentials.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// Network error talking to the remote experiment source.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// The blocking assignment task panicked.
    #[error("assignment task panicked")]
    TaskPanicked,
}

impl Error {
    /// Return `true` if the operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }

    pub(crate) fn validation(message: impl Into<String>) -> Error {
        Error::Validation(vec![message.into()])
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match value.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Error::StorageUnavailable(value.to_string())
            }
            _ => Error::Storage(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn only_unavailable_storage_is_transient() {
        assert!(Error::StorageUnavailable("busy".into()).is_transient());
        assert!(!Error::Storage("corrupt".into()).is_transient());
        assert!(!Error::validation("empty testId").is_transient());
        assert!(!Error::Unauthorized.is_transient());
    }

    #[test]
    fn busy_sqlite_maps_to_unavailable() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(Error::from(busy), Error::StorageUnavailable(_)));

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(matches!(Error::from(constraint), Error::Storage(_)));
    }

    #[test]
    fn validation_message_lists_details() {
        let err = Error::Validation(vec!["testId is required".into(), "userId is required".into()]);
        assert_eq!(
            err.to_string(),
            "validation failed: testId is required; userId is required"
        );
    }
}
