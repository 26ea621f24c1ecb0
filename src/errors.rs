//! Gateway-wide error taxonomy.
//!
//! Every failed gateway call yields exactly one [`GatewayError`].  Backend
//! failures are converted into this type by [`crate::normalize`] before
//! they leave the backend call boundary, so callers never see a
//! backend-specific error value.

use http::StatusCode;
use thiserror::Error;

/// The fixed error taxonomy exposed to the S3 front end.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The bucket, object, upload or policy does not exist.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// The resource already exists.
    #[error("already exists: {message}")]
    AlreadyExists { message: String },

    /// The caller is not permitted to perform the operation.
    #[error("access denied: {message}")]
    AccessDenied { message: String },

    /// A request argument is invalid (includes part and checksum mismatches).
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The backend cannot support this operation.
    #[error("not implemented: {message}")]
    NotImplemented { message: String },

    /// The operation timed out or was cancelled.
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// The backend is temporarily unavailable.
    #[error("unavailable: {message}")]
    Unavailable { message: String },

    /// Unexpected failure, including unparsable backend error bodies.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Discriminant of [`GatewayError`], handy for assertions and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    AccessDenied,
    InvalidArgument,
    NotImplemented,
    Timeout,
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// Lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl GatewayError {
    pub fn not_found(message: impl Into<String>) -> Self {
        GatewayError::NotFound {
            message: message.into(),
        }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        GatewayError::AlreadyExists {
            message: message.into(),
        }
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        GatewayError::AccessDenied {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        GatewayError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        GatewayError::NotImplemented {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        GatewayError::Timeout {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        GatewayError::Unavailable {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        GatewayError::Internal {
            message: message.into(),
        }
    }

    /// Return the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::NotFound { .. } => ErrorKind::NotFound,
            GatewayError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            GatewayError::AccessDenied { .. } => ErrorKind::AccessDenied,
            GatewayError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            GatewayError::NotImplemented { .. } => ErrorKind::NotImplemented,
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
            GatewayError::Unavailable { .. } => ErrorKind::Unavailable,
            GatewayError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Human-readable detail carried by the error.
    pub fn message(&self) -> &str {
        match self {
            GatewayError::NotFound { message }
            | GatewayError::AlreadyExists { message }
            | GatewayError::AccessDenied { message }
            | GatewayError::InvalidArgument { message }
            | GatewayError::NotImplemented { message }
            | GatewayError::Timeout { message }
            | GatewayError::Unavailable { message }
            | GatewayError::Internal { message } => message,
        }
    }

    /// Whether the failed call may be retried. Only timeouts and transient
    /// unavailability qualify; callers must still respect per-operation
    /// idempotency.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout { .. } | GatewayError::Unavailable { .. }
        )
    }

    /// Return the S3 XML error code string for this error.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NotFound { .. } => "NoSuchKey",
            GatewayError::AlreadyExists { .. } => "BucketAlreadyExists",
            GatewayError::AccessDenied { .. } => "AccessDenied",
            GatewayError::InvalidArgument { .. } => "InvalidArgument",
            GatewayError::NotImplemented { .. } => "NotImplemented",
            GatewayError::Timeout { .. } => "RequestTimeout",
            GatewayError::Unavailable { .. } => "ServiceUnavailable",
            GatewayError::Internal { .. } => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::AlreadyExists { .. } => StatusCode::CONFLICT,
            GatewayError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            GatewayError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            GatewayError::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            GatewayError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            GatewayError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenience alias used across the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(GatewayError::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(GatewayError::internal("x").kind(), ErrorKind::Internal);
        assert_eq!(
            GatewayError::not_implemented("anon put").kind(),
            ErrorKind::NotImplemented
        );
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(GatewayError::timeout("slow").is_retryable());
        assert!(GatewayError::unavailable("down").is_retryable());
        assert!(!GatewayError::invalid_argument("bad").is_retryable());
        assert!(!GatewayError::internal("boom").is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::access_denied("no").status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::not_implemented("no").status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(GatewayError::not_implemented("no").code(), "NotImplemented");
    }

    #[test]
    fn test_display_includes_message() {
        let err = GatewayError::invalid_argument("part 3 was never uploaded");
        assert_eq!(err.message(), "part 3 was never uploaded");
        assert!(err.to_string().contains("part 3"));
    }
}
