//! Error taxonomy
//!
//! A closed set of error codes shared by the Router, Executor and Notifier,
//! so that retry/ack behavior is testable instead of keyed off open strings.

use serde::{Deserialize, Serialize};

/// Stable, closed error code enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    InvalidAction,
    NotFound,
    Unauthorized,
    Forbidden,
    RateLimited,
    Timeout,
    InternalError,
    ServiceUnavailable,
}

impl ErrorCode {
    /// Whether errors of this kind are retried by the Executor / Notifier.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited
                | ErrorCode::Timeout
                | ErrorCode::ServiceUnavailable
                | ErrorCode::InternalError
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InvalidAction => "INVALID_ACTION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        };
        write!(f, "{s}")
    }
}

/// Retry metadata attached to an `error` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryInfo {
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

/// A Streamer-level error: a code, a message, and optional retry metadata.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct StreamerError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryInfo>,
}

impl StreamerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryInfo) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn invalid_action(action: &str) -> Self {
        Self::new(ErrorCode::InvalidAction, format!("unknown action: {action}"))
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Whether this error should trigger a retry path rather than a terminal failure.
    pub fn is_retryable(&self) -> bool {
        self.retry
            .as_ref()
            .map(|r| r.retryable)
            .unwrap_or_else(|| self.code.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_set_matches_expected_codes() {
        assert!(ErrorCode::RateLimited.is_retryable());
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::ServiceUnavailable.is_retryable());
        assert!(ErrorCode::InternalError.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::InvalidAction.is_retryable());
        assert!(!ErrorCode::Unauthorized.is_retryable());
        assert!(!ErrorCode::Forbidden.is_retryable());
        assert!(!ErrorCode::NotFound.is_retryable());
    }

    #[test]
    fn error_code_serializes_screaming_snake_case() {
        let json = serde_json::to_value(ErrorCode::ServiceUnavailable).unwrap();
        assert_eq!(json, "SERVICE_UNAVAILABLE");
    }

    #[test]
    fn explicit_retry_flag_overrides_code_default() {
        let err = StreamerError::new(ErrorCode::InternalError, "boom").with_retry(RetryInfo {
            retryable: false,
            ..Default::default()
        });
        assert!(!err.is_retryable());
    }
}
