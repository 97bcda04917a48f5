use relay_llm::LlmError;
use relay_tools::ToolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Llm(LlmError),

    #[error("tool {name} failed: {source}")]
    Tool {
        name: String,
        #[source]
        source: ToolError,
    },

    #[error("tool loop exceeded {max} rounds")]
    MaxToolCallsExceeded { max: usize },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("middleware {name} failed: {message}")]
    Middleware { name: String, message: String },

    #[error("conversation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(String),
}

impl ChatError {
    pub fn middleware(name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Middleware {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

/// Cancellation is the same condition whichever layer observed it.
impl From<LlmError> for ChatError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Cancelled => Self::Cancelled,
            other => Self::Llm(other),
        }
    }
}

impl From<std::io::Error> for ChatError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
