//! Centralized error types for mailcore.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// All errors produced by the mailcore library.
#[derive(Error, Debug)]
pub enum MailError {
    /// A message or mailbox failed a precondition. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The referenced mailbox does not exist.
    #[error("Mailbox not found: {0}")]
    MailboxNotFound(String),

    /// A record vanished or contradicted itself mid-operation.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// A repository call failed.
    #[error("Repository error: {0}")]
    Repository(String),

    /// The attachment store failed to read or write a payload.
    #[error("Attachment storage error: {0}")]
    Storage(String),

    /// Building or decoding a MIME structure failed.
    #[error("MIME error: {0}")]
    Mime(String),

    /// The outbound transport rejected or dropped the message.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport round trip did not finish before the deadline.
    #[error("timeout: transport did not complete within {0:?}")]
    Timeout(Duration),

    /// Configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error with the associated file path.
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias for `Result<T, MailError>`.
pub type Result<T> = std::result::Result<T, MailError>;

impl MailError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for a [`MailError::Validation`] with a formatted message.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// `true` for errors a caller may retry (infrastructure, not input).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Repository(_) | Self::Storage(_) | Self::Transport(_) | Self::Timeout(_)
        )
    }
}

impl From<std::io::Error> for MailError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_detail_is_distinguishable() {
        let err = MailError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().starts_with("timeout:"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_validation_is_not_transient() {
        let err = MailError::validation("no recipients");
        assert_eq!(err.to_string(), "Validation failed: no recipients");
        assert!(!err.is_transient());
    }
}
