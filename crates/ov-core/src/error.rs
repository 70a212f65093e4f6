use thiserror::Error;

/// Engine-wide error type. Every public failure maps to exactly one
/// stable code, returned by [`OvError::code`].
#[derive(Error, Debug)]
pub enum OvError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("not processed: {0}")]
    NotProcessed(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("cancelled")]
    Cancelled,
    #[error("dependency error: {0}")]
    DependencyError(String),
}

impl OvError {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            Self::NotProcessed(_) => "NOT_PROCESSED",
            Self::InvariantViolation(_) => "INVARIANT_VIOLATION",
            Self::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::DependencyError(_) => "DEPENDENCY_ERROR",
        }
    }

    /// Whether a retry with backoff is worthwhile. Rate limits, timeouts
    /// and backend hiccups are transient; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted(_) | Self::Timeout(_) | Self::DependencyError(_)
        )
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Self::InvalidArgument(what.into())
    }

    pub fn dependency(what: impl Into<String>) -> Self {
        Self::DependencyError(what.into())
    }
}

impl From<serde_json::Error> for OvError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvariantViolation(format!("corrupt record: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, OvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_stable() {
        assert_eq!(OvError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(OvError::AlreadyExists("x".into()).code(), "ALREADY_EXISTS");
        assert_eq!(OvError::InvalidArgument("x".into()).code(), "INVALID_ARGUMENT");
        assert_eq!(OvError::UnsupportedFormat("x".into()).code(), "UNSUPPORTED_FORMAT");
        assert_eq!(OvError::NotProcessed("x".into()).code(), "NOT_PROCESSED");
        assert_eq!(OvError::InvariantViolation("x".into()).code(), "INVARIANT_VIOLATION");
        assert_eq!(OvError::ResourceExhausted("x".into()).code(), "RESOURCE_EXHAUSTED");
        assert_eq!(OvError::Timeout("x".into()).code(), "TIMEOUT");
        assert_eq!(OvError::Cancelled.code(), "CANCELLED");
        assert_eq!(OvError::DependencyError("x".into()).code(), "DEPENDENCY_ERROR");
    }

    #[test]
    fn test_transient_classification() {
        assert!(OvError::Timeout("t".into()).is_transient());
        assert!(OvError::ResourceExhausted("rl".into()).is_transient());
        assert!(OvError::DependencyError("503".into()).is_transient());
        assert!(!OvError::InvalidArgument("bad".into()).is_transient());
        assert!(!OvError::UnsupportedFormat("pdf".into()).is_transient());
        assert!(!OvError::Cancelled.is_transient());
    }

    #[test]
    fn test_display_includes_detail() {
        let e = OvError::NotFound("viking://resources/x".into());
        assert!(e.to_string().contains("viking://resources/x"));
    }

    #[test]
    fn test_from_serde_json() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: OvError = bad.unwrap_err().into();
        assert_eq!(err.code(), "INVARIANT_VIOLATION");
    }
}
