use crate::error::{LlmError, Result};
use crate::http;
use crate::provider::{Capabilities, ChatRequest, ChunkStream, Provider, ProviderConfig};
use crate::sse::{SseDecoder, SseEvent, parse_data};
use crate::stream::{Translator, pump};
use crate::types::{
    BinarySource, ChatChunk, ChatMessage, ChatResponse, ContentPart, Role, ToolCall,
    ToolDefinition, Usage, split_system_messages,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const NAME: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            http: config.http_client(),
            api_key: config.require_api_key(NAME)?,
            base_url: config.base_url_or(DEFAULT_BASE_URL),
        })
    }

    async fn send(
        &self,
        body: &AnthropicRequest,
        request: &ChatRequest,
    ) -> Result<reqwest::Response> {
        let builder = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);
        http::send(NAME, builder, request).await
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self, model: &str) -> Capabilities {
        let m = model.to_ascii_lowercase();
        Capabilities {
            vision: true,
            native_schema: false,
            reasoning: m.contains("3-7") || m.contains("-4"),
            ..Capabilities::default()
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = AnthropicRequest::new(request, false);
        let response = self.send(&body, request).await?;
        let parsed: AnthropicResponse = http::read_json(response, request).await?;
        Ok(parsed.into())
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let body = AnthropicRequest::new(request, true);
        let response = self.send(&body, request).await?;
        Ok(pump(
            response.bytes_stream(),
            SseDecoder::new(),
            AnthropicTranslator::default(),
        ))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

impl AnthropicRequest {
    fn new(request: &ChatRequest, stream: bool) -> Self {
        let (instructions, turns) = split_system_messages(&request.messages);
        let system = instructions
            .iter()
            .map(|m| m.text().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        // Tool results travel as user turns; consecutive same-role turns merge.
        let mut messages: Vec<AnthropicMessage> = Vec::new();
        for m in &turns {
            let (role, blocks) = match m.role {
                Role::Assistant => ("assistant", assistant_blocks(m)),
                Role::Tool => ("user", vec![tool_result_block(m)]),
                _ => ("user", user_blocks(m)),
            };
            if blocks.is_empty() {
                continue;
            }
            match messages.last_mut() {
                Some(last) if last.role == role => last.content.extend(blocks),
                _ => messages.push(AnthropicMessage {
                    role,
                    content: blocks,
                }),
            }
        }

        Self {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: (!system.is_empty()).then_some(system),
            messages,
            tools: request.tools.iter().map(to_anthropic_tool).collect(),
            temperature: request.temperature,
            stream: stream.then_some(true),
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

fn to_anthropic_tool(t: &ToolDefinition) -> AnthropicTool {
    AnthropicTool {
        name: t.name.clone(),
        description: t.description.clone(),
        input_schema: t.parameters.clone(),
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    Image {
        source: AnthropicSource,
    },
    Document {
        source: AnthropicSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

fn binary_block(mime_type: &str, source: &BinarySource) -> AnthropicBlock {
    let source = match source {
        BinarySource::Base64(data) => AnthropicSource::Base64 {
            media_type: mime_type.to_string(),
            data: data.clone(),
        },
        BinarySource::Url(url) => AnthropicSource::Url { url: url.clone() },
    };
    if mime_type.starts_with("image/") {
        AnthropicBlock::Image { source }
    } else {
        AnthropicBlock::Document { source }
    }
}

fn user_blocks(m: &ChatMessage) -> Vec<AnthropicBlock> {
    m.content
        .parts()
        .into_iter()
        .map(|p| match p {
            ContentPart::Text { text } => AnthropicBlock::Text { text },
            ContentPart::Binary { mime_type, source } => binary_block(&mime_type, &source),
        })
        .collect()
}

fn tool_result_block(m: &ChatMessage) -> AnthropicBlock {
    AnthropicBlock::ToolResult {
        tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
        content: m.text(),
    }
}

fn assistant_blocks(m: &ChatMessage) -> Vec<AnthropicBlock> {
    let mut blocks = Vec::new();
    let text = m.text();
    if !text.trim().is_empty() {
        blocks.push(AnthropicBlock::Text { text });
    }
    for tc in &m.tool_calls {
        let input = tc.parse_arguments().unwrap_or_else(|e| {
            tracing::warn!(tool_call_id = %tc.id, error = %e, "tool arguments are not JSON; sending {{}}");
            serde_json::json!({})
        });
        blocks.push(AnthropicBlock::ToolUse {
            id: tc.id.clone(),
            name: tc.name.clone(),
            input,
        });
    }
    blocks
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<AnthropicResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicResponseBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

/// Anthropic reports cache reads and writes separately from `input_tokens`;
/// the canonical input count includes both.
impl From<AnthropicUsage> for Usage {
    fn from(u: AnthropicUsage) -> Self {
        let cached = u.cache_read_input_tokens.filter(|c| *c > 0);
        let creation = u.cache_creation_input_tokens.filter(|c| *c > 0);
        let input = u.input_tokens + cached.unwrap_or(0) + creation.unwrap_or(0);
        Usage {
            cached_tokens: cached,
            cache_creation_tokens: creation,
            ..Usage::new(input, u.output_tokens)
        }
    }
}

impl From<AnthropicResponse> for ChatResponse {
    fn from(v: AnthropicResponse) -> Self {
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();

        for block in v.content {
            match block {
                AnthropicResponseBlock::Text { text } => content.push_str(&text),
                AnthropicResponseBlock::Thinking { thinking } => reasoning.push_str(&thinking),
                AnthropicResponseBlock::ToolUse { id, name, input } => {
                    let arguments = if input.is_null() {
                        "{}".to_string()
                    } else {
                        input.to_string()
                    };
                    tool_calls.push(ToolCall::new(id, name, arguments));
                }
                AnthropicResponseBlock::Other => {}
            }
        }

        ChatResponse {
            content,
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            tool_calls,
            usage: v.usage.into(),
            finish_reason: v.stop_reason,
            model: v.model,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicStreamMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: AnthropicResponseBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: AnthropicDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        delta: AnthropicMessageDelta,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: AnthropicErrorBody,
    },
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

impl AnthropicErrorBody {
    fn into_error(self) -> LlmError {
        let status = match self.kind.as_str() {
            "authentication_error" => 401,
            "permission_error" => 403,
            "rate_limit_error" => 429,
            "invalid_request_error" => 400,
            "not_found_error" => 404,
            "overloaded_error" => 529,
            _ => 500,
        };
        LlmError::from_status(NAME, status, &self.message)
    }
}

#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    json: String,
}

/// Tool input JSON accumulates per content block and is released on block stop.
#[derive(Debug, Default)]
pub(crate) struct AnthropicTranslator {
    tools: HashMap<u32, PendingToolUse>,
    usage: AnthropicUsage,
    stop_reason: Option<String>,
    done: bool,
}

impl Translator<SseEvent> for AnthropicTranslator {
    fn on_item(&mut self, event: SseEvent) -> Vec<Result<ChatChunk>> {
        if self.done {
            return Vec::new();
        }
        let Some(parsed) = parse_data::<AnthropicStreamEvent>(NAME, &event.data) else {
            return Vec::new();
        };

        match parsed {
            AnthropicStreamEvent::MessageStart { message } => {
                self.usage = message.usage;
                Vec::new()
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                AnthropicResponseBlock::ToolUse { id, name, .. } => {
                    self.tools.insert(
                        index,
                        PendingToolUse {
                            id,
                            name,
                            json: String::new(),
                        },
                    );
                    Vec::new()
                }
                AnthropicResponseBlock::Text { text } if !text.is_empty() => {
                    vec![Ok(ChatChunk::content(text))]
                }
                _ => Vec::new(),
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicDelta::TextDelta { text } if !text.is_empty() => {
                    vec![Ok(ChatChunk::content(text))]
                }
                AnthropicDelta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                    vec![Ok(ChatChunk::reasoning(thinking))]
                }
                AnthropicDelta::InputJsonDelta { partial_json } => {
                    match self.tools.get_mut(&index) {
                        Some(pending) => pending.json.push_str(&partial_json),
                        None => tracing::warn!(index, "input_json_delta for unknown block"),
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            },
            AnthropicStreamEvent::ContentBlockStop { index } => match self.tools.remove(&index) {
                Some(p) => {
                    let args = if p.json.trim().is_empty() {
                        "{}".to_string()
                    } else {
                        p.json
                    };
                    vec![Ok(ChatChunk::tool_call(ToolCall::new(p.id, p.name, args)))]
                }
                None => Vec::new(),
            },
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(reason);
                }
                if let Some(u) = usage {
                    self.usage.output_tokens = u.output_tokens;
                    if u.input_tokens > 0 {
                        self.usage.input_tokens = u.input_tokens;
                    }
                }
                Vec::new()
            }
            AnthropicStreamEvent::MessageStop => self.finish(),
            AnthropicStreamEvent::Ping => Vec::new(),
            AnthropicStreamEvent::Error { error } => {
                self.done = true;
                self.tools.clear();
                vec![Err(error.into_error())]
            }
        }
    }

    fn finish(&mut self) -> Vec<Result<ChatChunk>> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        if !self.tools.is_empty() {
            tracing::warn!(open_blocks = self.tools.len(), "stream ended with unfinished tool blocks");
            self.tools.clear();
        }
        vec![Ok(ChatChunk::done(
            self.stop_reason.take(),
            Some(self.usage.clone().into()),
        ))]
    }
}
