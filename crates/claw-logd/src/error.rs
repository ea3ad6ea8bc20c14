//! Error types for the log service.

use thiserror::Error;

/// Errors that can occur in the log service.
#[derive(Debug, Error)]
pub enum LogdError {
    /// A filter identifier is blank, contains reserved characters, or uses a
    /// reserved prefix.
    #[error("invalid filter id: {0:?}")]
    InvalidIdentifier(String),

    /// A filter with the same identifier is already registered.
    #[error("duplicate filter id: {0}")]
    DuplicateFilter(String),

    /// No filter with the given identifier is registered.
    #[error("filter not found: {0}")]
    FilterNotFound(String),

    /// The document store rejected or failed an operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// Publishing an invalidation message failed.
    #[error("broadcast error: {0}")]
    Broadcast(String),

    /// An ingestion payload could not be decoded into a log record.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A query, sort, projection or pipeline stage is malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The backend does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Invalid service configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The service has been shut down.
    #[error("log service is shutting down")]
    ShuttingDown,

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LogdError {
    /// Returns true for errors caused by a bad filter definition supplied by
    /// the caller. No state is changed when one of these is returned.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidIdentifier(_) | Self::DuplicateFilter(_))
    }

    /// Wraps any displayable backend failure.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Result type alias for log service operations.
pub type Result<T> = std::result::Result<T, LogdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = LogdError::InvalidIdentifier("a.b".to_string());
        assert_eq!(err.to_string(), "invalid filter id: \"a.b\"");

        let err = LogdError::DuplicateFilter("errors".to_string());
        assert_eq!(err.to_string(), "duplicate filter id: errors");

        let err = LogdError::FilterNotFound("missing".to_string());
        assert_eq!(err.to_string(), "filter not found: missing");

        let err = LogdError::ShuttingDown;
        assert_eq!(err.to_string(), "log service is shutting down");

        let err = LogdError::Unsupported("map_reduce");
        assert_eq!(err.to_string(), "unsupported operation: map_reduce");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LogdError>();
    }

    #[test]
    fn validation_classification() {
        assert!(LogdError::InvalidIdentifier(String::new()).is_validation());
        assert!(LogdError::DuplicateFilter("x".to_string()).is_validation());
        assert!(!LogdError::FilterNotFound("x".to_string()).is_validation());
        assert!(!LogdError::Backend("down".to_string()).is_validation());
    }

    #[test]
    fn backend_helper_wraps_message() {
        let err = LogdError::backend("connection refused");
        assert_eq!(err.to_string(), "backend error: connection refused");
    }

    #[test]
    fn error_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: LogdError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn error_serde_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        assert!(parse.is_err());
        if let Err(e) = parse {
            let err: LogdError = e.into();
            assert!(err.to_string().starts_with("serialization error"));
        }
    }
}
