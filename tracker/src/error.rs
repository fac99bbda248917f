//! Error types for the CodeTrackr tracker.
//!
//! Each module owns a focused error enum; [`CodeTrackrError`] collects them
//! for callers that only need to report a failure.

use thiserror::Error;

use crate::config::ConfigError;
use crate::credentials::{CredentialError, VerifyError};
use crate::delivery::DeliveryError;
use crate::scheduler::TrackerError;
use crate::source::SourceError;

/// Errors that can occur during tracker operations.
#[derive(Error, Debug)]
pub enum CodeTrackrError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Loading or saving the API key failed.
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    /// The collector could not confirm the API key.
    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),

    /// An interval could not be delivered.
    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    /// An event source failed.
    #[error("event source error: {0}")]
    Source(#[from] SourceError),

    /// The tracker task is gone.
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// Building the HTTP client failed.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using [`CodeTrackrError`].
pub type Result<T> = std::result::Result<T, CodeTrackrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CodeTrackrError::from(ConfigError::InvalidValue {
            key: "CODETRACKR_LINE_CACHE_SIZE".to_string(),
            message: "cache size must be greater than 0".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "configuration error: invalid value for CODETRACKR_LINE_CACHE_SIZE: cache size must be greater than 0"
        );

        let err = CodeTrackrError::from(TrackerError::Closed);
        assert_eq!(err.to_string(), "tracker is no longer running");
    }

    #[test]
    fn test_delivery_error_converts() {
        let err: CodeTrackrError = DeliveryError::Unauthorized.into();
        assert!(matches!(
            err,
            CodeTrackrError::Delivery(DeliveryError::Unauthorized)
        ));
    }
}
