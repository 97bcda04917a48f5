//! The conversation engine.
//!
//! A [`Chat`] owns its history and cumulative usage. Each `ask`/`stream`
//! call appends the user message, then alternates provider rounds and tool
//! batches until the model answers without tool calls, the round bound is
//! exceeded, or the call is cancelled.

use crate::error::{ChatError, Result};
use crate::hooks::{Hooks, ToolErrorDirective};
use crate::middleware::{Middleware, MiddlewareContext, Pipeline};
use crate::options::{AskOptions, ToolExecution};
use crate::stream::ChatStream;
use futures_util::{FutureExt, StreamExt};
use relay_llm::{
    Capabilities, ChatChunk, ChatMessage, ChatRequest, ChatResponse, Content, LlmError,
    PricingTable, Provider, ResponseFormat, Schema, ToolCall, ToolDefinition, Usage, merge_content,
    split_system_messages,
};
use relay_tools::{Tool, ToolError, to_llm_tool_def};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_TOOL_CALLS: usize = 5;

pub struct Chat {
    provider: Arc<dyn Provider>,
    model: String,
    instructions: Vec<String>,
    history: Vec<ChatMessage>,
    tools: Vec<Arc<dyn Tool>>,
    schema: Option<Schema>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    headers: BTreeMap<String, String>,
    tool_execution: ToolExecution,
    max_tool_calls: usize,
    request_timeout: Option<Duration>,
    pricing: Option<Arc<PricingTable>>,
    middleware: Pipeline,
    hooks: Hooks,
    total_usage: Usage,
}

impl std::fmt::Debug for Chat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chat")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("history", &self.history.len())
            .field("tools", &self.tools.len())
            .field("tool_execution", &self.tool_execution)
            .field("middleware", &self.middleware)
            .finish()
    }
}

/// Where one call is in its exchange with the provider. Errors leave the
/// loop directly.
enum TurnState {
    AwaitingProvider,
    ExecutingTools(Vec<ToolCall>),
    Done(ChatMessage),
}

/// Per-call state shared by every round of one `ask`/`stream`.
struct Turn {
    ctx: MiddlewareContext,
    cancel: CancellationToken,
    sink: Option<UnboundedSender<ChatChunk>>,
    capabilities: Capabilities,
    tool_defs: Vec<ToolDefinition>,
    rounds: usize,
    steps: usize,
}

impl Turn {
    fn forward(&self, chunk: ChatChunk) {
        if let Some(tx) = &self.sink {
            if tx.send(chunk).is_err() {
                tracing::debug!("chat stream receiver dropped");
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ChatError::Cancelled);
        }
        Ok(())
    }
}

impl Chat {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            instructions: Vec::new(),
            history: Vec::new(),
            tools: Vec::new(),
            schema: None,
            temperature: None,
            max_tokens: None,
            headers: BTreeMap::new(),
            tool_execution: ToolExecution::Auto,
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            request_timeout: None,
            pricing: None,
            middleware: Pipeline::default(),
            hooks: Hooks::default(),
            total_usage: Usage::default(),
        }
    }

    /// Replaces any instructions set so far.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = vec![instructions.into()];
        self
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Structured output for every answer of this conversation.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_tool_execution(mut self, mode: ToolExecution) -> Self {
        self.tool_execution = mode;
        self
    }

    /// Tool batches allowed per call before the loop fails.
    pub fn with_max_tool_calls(mut self, max: usize) -> Self {
        self.max_tool_calls = max;
        self
    }

    /// Bounds each provider call, not the whole conversation.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_pricing(mut self, pricing: Arc<PricingTable>) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Seed prior turns. Instruction messages join the instructions; the rest
    /// become history in order.
    pub fn with_history(mut self, messages: Vec<ChatMessage>) -> Self {
        let (instructions, turns) = split_system_messages(&messages);
        self.instructions.extend(
            instructions
                .iter()
                .map(ChatMessage::text)
                .filter(|t| !t.trim().is_empty()),
        );
        self.history.extend(turns);
        self
    }

    pub fn with_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn on_tool_call_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ToolCall) + Send + Sync + 'static,
    {
        self.hooks.tool_call_start.push(Arc::new(hook));
        self
    }

    pub fn on_tool_call_end<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ToolCall, &serde_json::Value) + Send + Sync + 'static,
    {
        self.hooks.tool_call_end.push(Arc::new(hook));
        self
    }

    /// Returning `None` leaves the decision to the default policy.
    pub fn on_tool_call_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ToolCall, &ToolError) -> Option<ToolErrorDirective> + Send + Sync + 'static,
    {
        self.hooks.tool_call_error.push(Arc::new(hook));
        self
    }

    /// Consulted for every call under [`ToolExecution::Confirm`].
    pub fn on_confirm_tool_call<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ToolCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.hooks.confirm = Some(Arc::new(move |call| hook(call).boxed()));
        self
    }

    pub fn before_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[ChatMessage]) + Send + Sync + 'static,
    {
        self.hooks.before_request.push(Arc::new(hook));
        self
    }

    pub fn after_response<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ChatResponse) + Send + Sync + 'static,
    {
        self.hooks.after_response.push(Arc::new(hook));
        self
    }

    pub fn on_end_message<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.hooks.end_message.push(Arc::new(hook));
        self
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn total_usage(&self) -> &Usage {
        &self.total_usage
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn tool_execution(&self) -> ToolExecution {
        self.tool_execution
    }

    /// Runs the whole tool loop and returns the final assistant message.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(provider = %self.provider.name(), model = %self.model)
    )]
    pub async fn ask(&mut self, text: impl Into<String>, options: AskOptions) -> Result<ChatMessage> {
        self.run(text.into(), options, None).await
    }

    /// Like [`Chat::ask`], yielding every chunk as it arrives. Each provider
    /// round ends with its own `done` chunk.
    pub fn stream(&mut self, text: impl Into<String>, options: AskOptions) -> ChatStream<'_> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let text = text.into();
        ChatStream::new(rx, Box::pin(async move { self.run(text, options, Some(tx)).await }))
    }

    async fn run(
        &mut self,
        text: String,
        options: AskOptions,
        sink: Option<UnboundedSender<ChatChunk>>,
    ) -> Result<ChatMessage> {
        let mut turn = Turn {
            ctx: MiddlewareContext::new(self.provider.name(), self.model.clone()),
            cancel: options.cancel.clone().unwrap_or_default(),
            sink,
            capabilities: self.provider.capabilities(&self.model),
            tool_defs: Vec::new(),
            rounds: 0,
            steps: 0,
        };
        tracing::info!(
            request_id = %turn.ctx.request_id,
            prior_history_messages = self.history.len(),
            tools_registered = self.tools.len(),
            tool_execution = %self.tool_execution,
            streaming = turn.sink.is_some(),
            "chat turn started"
        );

        let result = self.drive(text, &options, &mut turn).await;
        match &result {
            Ok(message) => tracing::info!(
                request_id = %turn.ctx.request_id,
                rounds = turn.rounds,
                response_len = message.text().len(),
                history_messages = self.history.len(),
                total_input_tokens = self.total_usage.input_tokens,
                total_output_tokens = self.total_usage.output_tokens,
                "chat turn completed"
            ),
            Err(e) => {
                tracing::warn!(
                    request_id = %turn.ctx.request_id,
                    rounds = turn.rounds,
                    error = %e,
                    "chat turn failed"
                );
                self.middleware.error(&mut turn.ctx, e).await;
            }
        }
        result
    }

    async fn drive(&mut self, text: String, options: &AskOptions, turn: &mut Turn) -> Result<ChatMessage> {
        turn.tool_defs = self
            .tools
            .iter()
            .map(|t| to_llm_tool_def(t.as_ref()))
            .collect::<relay_llm::Result<Vec<_>>>()
            .map_err(|e| ChatError::Validation(e.to_string()))?;

        let parts = options.resolve_parts().await?;
        turn.check_cancelled()?;
        let content = if parts.is_empty() {
            Content::Text(text)
        } else {
            merge_content(text, parts)
        };
        self.validate(&content, turn)?;
        self.history.push(ChatMessage::user(content));

        // A failed call keeps only its user message so history never holds
        // tool calls without results.
        let base = self.history.len();
        let result = self.run_turn(turn).await;
        if result.is_err() && self.history.len() > base {
            tracing::debug!(
                discarded_messages = self.history.len() - base,
                "rolling back partial turn"
            );
            self.history.truncate(base);
        }
        result
    }

    async fn run_turn(&mut self, turn: &mut Turn) -> Result<ChatMessage> {
        let mut state = TurnState::AwaitingProvider;
        loop {
            state = match state {
                TurnState::Done(message) => {
                    self.middleware.response(&mut turn.ctx, &message).await?;
                    self.hooks.end_message(&message);
                    return Ok(message);
                }
                TurnState::AwaitingProvider => {
                    turn.check_cancelled()?;
                    self.provider_round(turn).await?
                }
                TurnState::ExecutingTools(calls) => {
                    turn.check_cancelled()?;
                    self.execute_tools(calls, turn).await?
                }
            };
        }
    }

    fn validate(&self, content: &Content, turn: &Turn) -> Result<()> {
        let caps = &turn.capabilities;
        let unsupported = |what: &str| {
            ChatError::Validation(format!(
                "{} model {} does not support {what}",
                self.provider.name(),
                self.model
            ))
        };
        if content.has_images() && !caps.vision {
            return Err(unsupported("image input"));
        }
        if !turn.tool_defs.is_empty() && !caps.tools {
            return Err(unsupported("tools"));
        }
        if self.schema.is_some() && !caps.structured_output {
            return Err(unsupported("structured output"));
        }
        Ok(())
    }

    /// Instructions as one leading system message, then the history.
    fn request_messages(&self, caps: &Capabilities) -> Vec<ChatMessage> {
        let mut system: Vec<String> = self
            .instructions
            .iter()
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .collect();
        if let Some(schema) = &self.schema {
            if !caps.native_schema {
                system.push(ResponseFormat::from_schema(schema).instruction());
            }
        }

        let mut messages = Vec::with_capacity(self.history.len() + 1);
        if !system.is_empty() {
            messages.push(ChatMessage::system(system.join("\n\n")));
        }
        messages.extend(self.history.iter().cloned());
        messages
    }

    async fn provider_round(&mut self, turn: &mut Turn) -> Result<TurnState> {
        turn.rounds += 1;
        turn.ctx.messages = self.request_messages(&turn.capabilities);
        self.middleware.request(&mut turn.ctx).await?;
        self.hooks.request(&turn.ctx.messages);

        let mut request = ChatRequest::new(self.model.clone(), turn.ctx.messages.clone())
            .with_tools(turn.tool_defs.clone())
            .with_cancellation(turn.cancel.clone());
        request.temperature = self.temperature;
        request.max_tokens = self.max_tokens;
        request.response_format = self.schema.as_ref().map(ResponseFormat::from_schema);
        request.headers = self.headers.clone();
        request.timeout = self.request_timeout;

        tracing::debug!(
            round = turn.rounds,
            prompt_messages = request.messages.len(),
            tools = request.tools.len(),
            "provider round started"
        );
        let started = Instant::now();
        let mut response = if turn.capabilities.streaming {
            self.stream_round(&request, turn).await?
        } else {
            self.chat_round(&request, turn).await?
        };
        turn.check_cancelled()?;

        if let Some(pricing) = &self.pricing {
            pricing.apply(self.provider.name(), &self.model, &mut response.usage);
        }
        self.total_usage.accumulate(&response.usage);
        tracing::info!(
            round = turn.rounds,
            latency_ms = started.elapsed().as_millis() as u64,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            cost = ?response.usage.cost,
            tool_calls = response.tool_calls.len(),
            finish_reason = ?response.finish_reason,
            "provider round completed"
        );
        self.hooks.response(&response);

        let message = response.into_message();
        if message.tool_calls.is_empty() {
            self.history.push(message.clone());
            return Ok(TurnState::Done(message));
        }
        if self.tool_execution == ToolExecution::DryRun {
            tracing::info!(
                tool_calls = message.tool_calls.len(),
                "dry run; returning tool calls without executing them"
            );
            // Unanswered calls stay on the returned message only.
            if !message.text().trim().is_empty() {
                self.history.push(ChatMessage {
                    tool_calls: Vec::new(),
                    ..message.clone()
                });
            }
            return Ok(TurnState::Done(message));
        }

        let calls = message.tool_calls.clone();
        self.history.push(message);
        Ok(TurnState::ExecutingTools(calls))
    }

    async fn stream_round(&self, request: &ChatRequest, turn: &Turn) -> Result<ChatResponse> {
        let opened = tokio::select! {
            _ = turn.cancel.cancelled() => return Err(ChatError::Cancelled),
            stream = self.provider.stream(request) => stream,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(LlmError::Unsupported(reason)) => {
                tracing::debug!(reason = %reason, "streaming unavailable; falling back to chat");
                return self.chat_round(request, turn).await;
            }
            Err(e) => return Err(e.into()),
        };

        let mut response = ChatResponse {
            model: Some(self.model.clone()),
            ..Default::default()
        };
        let mut reasoning = String::new();
        loop {
            let next = tokio::select! {
                _ = turn.cancel.cancelled() => return Err(ChatError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            if let Some(text) = &chunk.content {
                response.content.push_str(text);
            }
            if let Some(text) = &chunk.reasoning {
                reasoning.push_str(text);
            }
            if let Some(calls) = &chunk.tool_calls {
                response.tool_calls.extend(calls.iter().cloned());
            }
            if let Some(usage) = &chunk.usage {
                response.usage = usage.clone();
            }
            if chunk.finish_reason.is_some() {
                response.finish_reason = chunk.finish_reason.clone();
            }
            let done = chunk.done;
            turn.forward(chunk);
            if done {
                break;
            }
        }
        response.reasoning = (!reasoning.is_empty()).then_some(reasoning);
        Ok(response)
    }

    async fn chat_round(&self, request: &ChatRequest, turn: &Turn) -> Result<ChatResponse> {
        let response = tokio::select! {
            _ = turn.cancel.cancelled() => return Err(ChatError::Cancelled),
            response = self.provider.chat(request) => response?,
        };
        if turn.sink.is_some() {
            if let Some(text) = &response.reasoning {
                turn.forward(ChatChunk::reasoning(text.clone()));
            }
            if !response.content.is_empty() {
                turn.forward(ChatChunk::content(response.content.clone()));
            }
            if !response.tool_calls.is_empty() {
                turn.forward(ChatChunk {
                    tool_calls: Some(response.tool_calls.clone()),
                    ..Default::default()
                });
            }
            turn.forward(ChatChunk::done(
                response.finish_reason.clone(),
                Some(response.usage.clone()),
            ));
        }
        Ok(response)
    }

    /// Runs one batch in the order the model returned it.
    async fn execute_tools(&mut self, calls: Vec<ToolCall>, turn: &mut Turn) -> Result<TurnState> {
        turn.steps += 1;
        if turn.steps > self.max_tool_calls {
            tracing::error!(max_tool_calls = self.max_tool_calls, "tool loop limit reached");
            return Err(ChatError::MaxToolCallsExceeded {
                max: self.max_tool_calls,
            });
        }

        for call in calls {
            turn.check_cancelled()?;
            tracing::info!(
                step = turn.steps,
                tool_call_id = %call.id,
                tool_name = %call.name,
                arguments_len = call.arguments.len(),
                "handling tool call"
            );

            if self.tool_execution == ToolExecution::Confirm {
                let approved = tokio::select! {
                    _ = turn.cancel.cancelled() => return Err(ChatError::Cancelled),
                    approved = self.hooks.confirm(&call) => approved,
                };
                if !approved {
                    tracing::warn!(
                        tool_call_id = %call.id,
                        tool_name = %call.name,
                        "tool call rejected by confirmation"
                    );
                    self.history.push(ChatMessage::tool_result(
                        call.id.clone(),
                        json!({ "error": "tool call cancelled" }).to_string(),
                    ));
                    continue;
                }
            }

            self.hooks.tool_call_started(&call);
            self.middleware.tool_call_start(&mut turn.ctx, &call).await?;

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = turn.cancel.cancelled() => return Err(ChatError::Cancelled),
                outcome = self.invoke_tool(&call) => outcome,
            };
            match outcome {
                Ok(value) => {
                    let output = tool_output_text(&value);
                    tracing::info!(
                        tool_call_id = %call.id,
                        tool_name = %call.name,
                        latency_ms = started.elapsed().as_millis() as u64,
                        output_len = output.len(),
                        "tool call executed"
                    );
                    self.history
                        .push(ChatMessage::tool_result(call.id.clone(), output));
                    self.hooks.tool_call_ended(&call, &value);
                    self.middleware
                        .tool_call_end(&mut turn.ctx, &call, &value)
                        .await?;
                }
                Err(error) => {
                    match self.directive_for(&call, &error) {
                        ToolErrorDirective::Stop => {
                            tracing::error!(
                                tool_call_id = %call.id,
                                tool_name = %call.name,
                                error = %error,
                                "tool call failed; stopping"
                            );
                            return Err(ChatError::Tool {
                                name: call.name.clone(),
                                source: error,
                            });
                        }
                        ToolErrorDirective::Continue => {
                            tracing::warn!(
                                tool_call_id = %call.id,
                                tool_name = %call.name,
                                error = %error,
                                "tool call failed; reporting to model"
                            );
                            self.history.push(ChatMessage::tool_result(
                                call.id.clone(),
                                json!({ "error": error.to_string() }).to_string(),
                            ));
                        }
                    }
                }
            }
        }
        Ok(TurnState::AwaitingProvider)
    }

    /// Authentication failures always stop. Otherwise a hook's directive
    /// wins, then the error's own fatality.
    fn directive_for(&self, call: &ToolCall, error: &ToolError) -> ToolErrorDirective {
        let directive = self.hooks.tool_call_failed(call, error);
        if error.is_auth() {
            return ToolErrorDirective::Stop;
        }
        directive.unwrap_or(if error.is_fatal() {
            ToolErrorDirective::Stop
        } else {
            ToolErrorDirective::Continue
        })
    }

    async fn invoke_tool(&self, call: &ToolCall) -> relay_tools::Result<serde_json::Value> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.spec().name == call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        let args = call
            .parse_arguments()
            .map_err(|e| ToolError::InvalidArguments(format!("{}: {e}", call.name)))?;
        tool.execute(args).await
    }
}

fn tool_output_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
