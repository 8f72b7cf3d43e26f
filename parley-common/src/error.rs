//! Error types for the Parley backend.

use thiserror::Error;

/// Result type alias using the Parley error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for Parley services.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Content type outside the accepted allow-list
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Upload exceeds the configured size limit
    #[error("Payload too large: limit is {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Endpoint requires an active session
    #[error("No active session")]
    SessionRequired,

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upstream model API error (network failure, bad status, bad payload)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Upstream call timed out
    #[error("Upstream request timed out")]
    Timeout,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Get the HTTP status code for this error.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::SessionRequired => 401,
            Self::NotFound(_) => 404,
            Self::PayloadTooLarge { .. } => 413,
            Self::UnsupportedMediaType(_) => 415,
            Self::Upstream(_) => 502,
            Self::Timeout => 504,
            _ => 500,
        }
    }

    /// Stable machine-readable error code for API responses.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::SessionRequired => "SESSION_REQUIRED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::Timeout => "UPSTREAM_TIMEOUT",
            Self::Internal(_) | Self::Json(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error is safe to show to clients verbatim.
    ///
    /// Internal errors are logged with full context server-side and
    /// replaced by a generic message at the boundary.
    pub const fn is_client_safe(&self) -> bool {
        !matches!(self, Self::Internal(_) | Self::Json(_) | Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(Error::InvalidInput("test".into()).status_code(), 400);
        assert_eq!(Error::SessionRequired.status_code(), 401);
        assert_eq!(Error::NotFound("test".into()).status_code(), 404);
        assert_eq!(Error::PayloadTooLarge { limit: 4096 }.status_code(), 413);
        assert_eq!(
            Error::UnsupportedMediaType("text/plain".into()).status_code(),
            415
        );
        assert_eq!(Error::Upstream("test".into()).status_code(), 502);
        assert_eq!(Error::Timeout.status_code(), 504);
        assert_eq!(Error::Internal("test".into()).status_code(), 500);
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::PayloadTooLarge { limit: 1 }.code(), "PAYLOAD_TOO_LARGE");
        assert_eq!(Error::SessionRequired.code(), "SESSION_REQUIRED");
        assert_eq!(Error::Timeout.code(), "UPSTREAM_TIMEOUT");
    }

    #[test]
    fn test_internal_errors_are_not_client_safe() {
        assert!(!Error::Internal("stack trace".into()).is_client_safe());
        assert!(Error::InvalidInput("missing message".into()).is_client_safe());
        assert!(Error::Upstream("api down".into()).is_client_safe());
    }
}
