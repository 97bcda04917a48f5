//! Lifecycle callbacks registered on a [`crate::Chat`].

use futures_util::future::BoxFuture;
use relay_llm::{ChatMessage, ChatResponse, ToolCall};
use relay_tools::ToolError;
use std::sync::Arc;

/// Returned by a tool-error hook to override the default policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolErrorDirective {
    /// Re-raise and end the conversation.
    Stop,
    /// Report the failure to the model and keep going.
    Continue,
}

pub type ToolCallStartHook = Arc<dyn Fn(&ToolCall) + Send + Sync>;
pub type ToolCallEndHook = Arc<dyn Fn(&ToolCall, &serde_json::Value) + Send + Sync>;
pub type ToolCallErrorHook =
    Arc<dyn Fn(&ToolCall, &ToolError) -> Option<ToolErrorDirective> + Send + Sync>;
pub type ConfirmHook = Arc<dyn Fn(ToolCall) -> BoxFuture<'static, bool> + Send + Sync>;
pub type RequestHook = Arc<dyn Fn(&[ChatMessage]) + Send + Sync>;
pub type ResponseHook = Arc<dyn Fn(&ChatResponse) + Send + Sync>;
pub type MessageHook = Arc<dyn Fn(&ChatMessage) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) tool_call_start: Vec<ToolCallStartHook>,
    pub(crate) tool_call_end: Vec<ToolCallEndHook>,
    pub(crate) tool_call_error: Vec<ToolCallErrorHook>,
    pub(crate) confirm: Option<ConfirmHook>,
    pub(crate) before_request: Vec<RequestHook>,
    pub(crate) after_response: Vec<ResponseHook>,
    pub(crate) end_message: Vec<MessageHook>,
}

impl Hooks {
    pub(crate) fn tool_call_started(&self, call: &ToolCall) {
        for hook in &self.tool_call_start {
            hook(call);
        }
    }

    pub(crate) fn tool_call_ended(&self, call: &ToolCall, result: &serde_json::Value) {
        for hook in &self.tool_call_end {
            hook(call, result);
        }
    }

    /// Every hook sees the error; the first directive returned wins.
    pub(crate) fn tool_call_failed(
        &self,
        call: &ToolCall,
        error: &ToolError,
    ) -> Option<ToolErrorDirective> {
        let mut directive = None;
        for hook in &self.tool_call_error {
            let returned = hook(call, error);
            if directive.is_none() {
                directive = returned;
            }
        }
        directive
    }

    /// No confirmation hook means nothing is approved.
    pub(crate) async fn confirm(&self, call: &ToolCall) -> bool {
        match &self.confirm {
            Some(hook) => hook(call.clone()).await,
            None => false,
        }
    }

    pub(crate) fn request(&self, messages: &[ChatMessage]) {
        for hook in &self.before_request {
            hook(messages);
        }
    }

    pub(crate) fn response(&self, response: &ChatResponse) {
        for hook in &self.after_response {
            hook(response);
        }
    }

    pub(crate) fn end_message(&self, message: &ChatMessage) {
        for hook in &self.end_message {
            hook(message);
        }
    }
}
