//! Ordered request/response interceptors.
//!
//! Middlewares run in registration order at every stage; they are not
//! nested. One [`MiddlewareContext`] lives for a whole `ask`/`stream` call,
//! so state written in `on_request` is visible again in `on_response`.

use crate::error::{ChatError, Result};
use async_trait::async_trait;
use relay_llm::{ChatMessage, ToolCall};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MiddlewareContext {
    pub request_id: Uuid,
    pub provider: String,
    pub model: String,
    /// The messages about to be sent; middlewares may rewrite them.
    pub messages: Vec<ChatMessage>,
    pub state: Map<String, Value>,
}

impl MiddlewareContext {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            provider: provider.into(),
            model: model.into(),
            messages: Vec::new(),
            state: Map::new(),
        }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Before every provider round.
    async fn on_request(&self, _ctx: &mut MiddlewareContext) -> Result<()> {
        Ok(())
    }

    /// Once, after the final assistant message of the call.
    async fn on_response(&self, _ctx: &mut MiddlewareContext, _message: &ChatMessage) -> Result<()> {
        Ok(())
    }

    async fn on_tool_call_start(&self, _ctx: &mut MiddlewareContext, _call: &ToolCall) -> Result<()> {
        Ok(())
    }

    async fn on_tool_call_end(
        &self,
        _ctx: &mut MiddlewareContext,
        _call: &ToolCall,
        _result: &Value,
    ) -> Result<()> {
        Ok(())
    }

    /// Sees every error before it reaches the caller.
    async fn on_error(&self, _ctx: &mut MiddlewareContext, _error: &ChatError) {}
}

#[derive(Clone, Default)]
pub(crate) struct Pipeline {
    entries: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub(crate) fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.entries.push(middleware);
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.entries.iter().map(|m| m.name().to_string()).collect()
    }

    pub(crate) async fn request(&self, ctx: &mut MiddlewareContext) -> Result<()> {
        for m in &self.entries {
            tracing::trace!(middleware = m.name(), "on_request");
            m.on_request(ctx).await?;
        }
        Ok(())
    }

    pub(crate) async fn response(&self, ctx: &mut MiddlewareContext, message: &ChatMessage) -> Result<()> {
        for m in &self.entries {
            tracing::trace!(middleware = m.name(), "on_response");
            m.on_response(ctx, message).await?;
        }
        Ok(())
    }

    pub(crate) async fn tool_call_start(&self, ctx: &mut MiddlewareContext, call: &ToolCall) -> Result<()> {
        for m in &self.entries {
            m.on_tool_call_start(ctx, call).await?;
        }
        Ok(())
    }

    pub(crate) async fn tool_call_end(
        &self,
        ctx: &mut MiddlewareContext,
        call: &ToolCall,
        result: &Value,
    ) -> Result<()> {
        for m in &self.entries {
            m.on_tool_call_end(ctx, call, result).await?;
        }
        Ok(())
    }

    pub(crate) async fn error(&self, ctx: &mut MiddlewareContext, error: &ChatError) {
        for m in &self.entries {
            m.on_error(ctx, error).await;
        }
    }
}

/// Logs each call with its latency, keyed by request id.
#[derive(Debug, Default)]
pub struct TracingMiddleware;

const STARTED_AT: &str = "tracing.started_at";

#[async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn on_request(&self, ctx: &mut MiddlewareContext) -> Result<()> {
        // Only the first round of a call records the start.
        if !ctx.state.contains_key(STARTED_AT) {
            ctx.state.insert(STARTED_AT.to_string(), Value::from(now_ms()));
        }
        tracing::info!(
            request_id = %ctx.request_id,
            provider = %ctx.provider,
            model = %ctx.model,
            messages = ctx.messages.len(),
            "chat request"
        );
        Ok(())
    }

    async fn on_response(&self, ctx: &mut MiddlewareContext, message: &ChatMessage) -> Result<()> {
        let started = ctx.state.get(STARTED_AT).and_then(Value::as_u64).unwrap_or_else(now_ms);
        let usage = message.usage.clone().unwrap_or_default();
        tracing::info!(
            request_id = %ctx.request_id,
            provider = %ctx.provider,
            model = %ctx.model,
            latency_ms = now_ms().saturating_sub(started),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "chat response"
        );
        Ok(())
    }

    async fn on_tool_call_start(&self, ctx: &mut MiddlewareContext, call: &ToolCall) -> Result<()> {
        tracing::info!(
            request_id = %ctx.request_id,
            tool_call_id = %call.id,
            tool_name = %call.name,
            "tool call started"
        );
        Ok(())
    }

    async fn on_error(&self, ctx: &mut MiddlewareContext, error: &ChatError) {
        tracing::warn!(request_id = %ctx.request_id, error = %error, "chat failed");
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
