//! Streaming conversation engine with a bounded tool loop.
//!
//! [`Chat`] holds one conversation against any [`relay_llm::Provider`]:
//! instructions, history, tools, structured-output schema, hooks and
//! middleware. `ask` returns the final assistant message; `stream` yields
//! chunks as they arrive and resolves to the same message.

mod chat;
mod error;
mod hooks;
mod middleware;
mod options;
mod stream;

pub use chat::{Chat, DEFAULT_MAX_TOOL_CALLS};
pub use error::{ChatError, Result};
pub use hooks::{
    ConfirmHook, MessageHook, RequestHook, ResponseHook, ToolCallEndHook, ToolCallErrorHook,
    ToolCallStartHook, ToolErrorDirective,
};
pub use middleware::{Middleware, MiddlewareContext, TracingMiddleware};
pub use options::{AskOptions, ToolExecution};
pub use stream::ChatStream;
