use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("http error (status {status}): {message}")]
    Http { status: u16, message: String },

    /// Ends the conversation regardless of the error policy in effect.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(String),
}

impl ToolError {
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Unauthorized(_) => true,
            Self::Http { status, .. } => matches!(status, 401 | 403),
            _ => false,
        }
    }

    /// Authentication-class failures and explicit fatals stop the tool loop;
    /// everything else is reported back to the model.
    pub fn is_fatal(&self) -> bool {
        self.is_auth() || matches!(self, Self::Fatal(_))
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidArguments(e.to_string())
    }
}
