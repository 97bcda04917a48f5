//! Tools the conversation engine can offer to a model.
//!
//! A [`Tool`] describes itself with a [`ToolSpec`] and executes JSON
//! arguments. Errors are classified so the engine can tell failures the
//! model should hear about from ones that must end the conversation.

mod error;
mod fn_tool;
mod traits;

pub use error::{Result, ToolError};
pub use fn_tool::FnTool;
pub use traits::{Tool, ToolSpec, optional_string, parse_arguments, require_string, to_llm_tool_def};
