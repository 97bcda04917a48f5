use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("bad request (status {status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("context window exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("authentication failed (status {status}): {message}")]
    Authentication { status: u16, message: String },

    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("stream parse error: {0}")]
    StreamParse(String),

    #[error("provider not registered: {0}")]
    ProviderNotRegistered(String),

    #[error("request signing failed: {0}")]
    Signing(String),
}

/// Body fragments that distinguish an overflowing prompt from any other 400.
const CONTEXT_LENGTH_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "context length",
    "context window",
    "maximum context",
    "prompt is too long",
    "input is too long",
    "too many tokens",
    "exceeds the maximum number of tokens",
];

impl LlmError {
    /// Classify a non-success HTTP response.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let message = format!("{provider}: {}", body.trim());
        match status {
            401 | 403 => Self::Authentication { status, message },
            429 => Self::RateLimited {
                message,
                retry_after: None,
            },
            500..=599 => Self::Server { status, message },
            _ if is_context_length_message(body) => Self::ContextLengthExceeded(message),
            _ => Self::BadRequest { status, message },
        }
    }

    pub fn with_retry_after(self, retry_after: Option<Duration>) -> Self {
        match self {
            Self::RateLimited { message, .. } => Self::RateLimited {
                message,
                retry_after,
            },
            other => other,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::BadRequest { status, .. }
            | Self::Authentication { status, .. }
            | Self::Server { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Informational only: nothing in this crate retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Timeout | Self::Http(_)
        )
    }
}

fn is_context_length_message(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    CONTEXT_LENGTH_MARKERS.iter().any(|m| lower.contains(m))
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_are_classified_as_authentication() {
        assert!(LlmError::from_status("openai", 401, "bad key").is_auth());
        assert!(LlmError::from_status("openai", 403, "forbidden").is_auth());
    }

    #[test]
    fn context_overflow_is_sniffed_from_bad_request_body() {
        let err = LlmError::from_status(
            "openai",
            400,
            r#"{"error":{"code":"context_length_exceeded","message":"This model's maximum context length is 8192 tokens"}}"#,
        );
        assert!(matches!(err, LlmError::ContextLengthExceeded(_)));

        let err = LlmError::from_status("anthropic", 400, "prompt is too long: 210000 tokens");
        assert!(matches!(err, LlmError::ContextLengthExceeded(_)));

        let err = LlmError::from_status("openai", 400, "invalid temperature");
        assert!(matches!(err, LlmError::BadRequest { status: 400, .. }));
    }

    #[test]
    fn rate_limit_and_server_errors_are_distinct() {
        let err = LlmError::from_status("gemini", 429, "slow down")
            .with_retry_after(Some(Duration::from_secs(3)));
        match err {
            LlmError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        let err = LlmError::from_status("bedrock", 503, "unavailable");
        assert_eq!(err.status(), Some(503));
        assert!(err.is_retryable());
    }
}
