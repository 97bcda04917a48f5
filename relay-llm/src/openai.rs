use crate::error::{LlmError, Result};
use crate::http;
use crate::provider::{Capabilities, ChatRequest, ChunkStream, Provider, ProviderConfig};
use crate::schema::{ResponseFormat, strict_schema};
use crate::sse::{SseDecoder, SseEvent, parse_data};
use crate::stream::{Translator, pump};
use crate::types::{
    ChatChunk, ChatMessage, ChatResponse, Content, ContentPart, Role, ToolCall, ToolDefinition,
    Usage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const NAME: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat Completions backend. Also speaks to OpenAI-compatible servers via `base_url`.
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            http: config.http_client(),
            api_key: config.require_api_key(NAME)?,
            base_url: config.base_url_or(DEFAULT_BASE_URL),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(
        &self,
        body: &OpenAiChatRequest,
        request: &ChatRequest,
    ) -> Result<reqwest::Response> {
        let builder = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body);
        http::send(NAME, builder, request).await
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self, model: &str) -> Capabilities {
        let m = model.to_ascii_lowercase();
        Capabilities {
            streaming: true,
            tools: true,
            vision: !m.starts_with("gpt-3.5"),
            structured_output: true,
            native_schema: true,
            reasoning: is_reasoning_model(&m),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let (tools, names) = ToolNameMap::build(&request.tools);
        let body = OpenAiChatRequest::new(request, &tools, &names, false);
        let response = self.send(&body, request).await?;
        let parsed: OpenAiChatResponse = http::read_json(response, request).await?;
        let mut out = ChatResponse::try_from(parsed)?;
        for call in &mut out.tool_calls {
            call.name = names.from_wire(&call.name);
        }
        Ok(out)
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let (tools, names) = ToolNameMap::build(&request.tools);
        let body = OpenAiChatRequest::new(request, &tools, &names, true);
        let response = self.send(&body, request).await?;
        Ok(pump(
            response.bytes_stream(),
            SseDecoder::new(),
            OpenAiTranslator::new(names),
        ))
    }
}

/// o-series and gpt-5 models reason before answering and reject `temperature`.
fn is_reasoning_model(model: &str) -> bool {
    let bytes = model.as_bytes();
    (bytes.len() > 1 && bytes[0] == b'o' && bytes[1].is_ascii_digit())
        || model.starts_with("gpt-5")
        || model.contains("deepseek-r1")
}

/// OpenAI tool names must match `^[a-zA-Z0-9_-]+$`. Names are rewritten on the
/// way out and mapped back on the way in.
#[derive(Debug, Clone, Default)]
pub(crate) struct ToolNameMap {
    forward: HashMap<String, String>,
    reverse: HashMap<String, String>,
}

impl ToolNameMap {
    pub(crate) fn build(tools: &[ToolDefinition]) -> (Vec<ToolDefinition>, Self) {
        let mut used: HashMap<String, usize> = HashMap::new();
        let mut map = Self::default();
        let mut out = Vec::with_capacity(tools.len());

        for t in tools {
            let mut name = sanitize_tool_name(&t.name);
            if let Some(n) = used.get_mut(&name) {
                *n += 1;
                name = format!("{name}_{}", *n);
            } else {
                used.insert(name.clone(), 0);
            }
            map.forward.insert(t.name.clone(), name.clone());
            map.reverse.insert(name.clone(), t.name.clone());
            out.push(ToolDefinition {
                name,
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            });
        }

        (out, map)
    }

    /// Names outside the current tool list (older history) are still sanitized.
    pub(crate) fn to_wire(&self, name: &str) -> String {
        self.forward
            .get(name)
            .cloned()
            .unwrap_or_else(|| sanitize_tool_name(name))
    }

    pub(crate) fn from_wire(&self, name: &str) -> String {
        self.reverse
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

fn sanitize_tool_name(name: &str) -> String {
    let out: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "tool".to_string() } else { out }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAiStreamOptions>,
}

#[derive(Debug, Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

impl OpenAiChatRequest {
    fn new(
        request: &ChatRequest,
        tools: &[ToolDefinition],
        names: &ToolNameMap,
        stream: bool,
    ) -> Self {
        let reasoning = is_reasoning_model(&request.model.to_ascii_lowercase());
        if reasoning && request.temperature.is_some() {
            tracing::debug!(model = %request.model, "dropping temperature for reasoning model");
        }
        let (max_tokens, max_completion_tokens) = if reasoning {
            (None, request.max_tokens)
        } else {
            (request.max_tokens, None)
        };

        Self {
            model: request.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| to_openai_message(m, names))
                .collect(),
            tools: tools.iter().map(to_openai_tool).collect(),
            tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
            temperature: request.temperature.filter(|_| !reasoning),
            max_tokens,
            max_completion_tokens,
            response_format: request.response_format.as_ref().map(to_openai_response_format),
            stream: stream.then_some(true),
            stream_options: stream.then_some(OpenAiStreamOptions {
                include_usage: true,
            }),
        }
    }
}

/// Strict mode only when the schema can be closed; OpenAI rejects open
/// objects under `strict: true`.
fn to_openai_response_format(format: &ResponseFormat) -> serde_json::Value {
    let closed = if format.strict {
        strict_schema(&format.schema)
    } else {
        None
    };
    if format.strict && closed.is_none() {
        tracing::debug!(
            schema = %format.name,
            "schema allows additional properties; sending non-strict json_schema"
        );
    }
    let strict = closed.is_some();
    let schema = closed.unwrap_or_else(|| format.schema.clone());
    serde_json::json!({
        "type": "json_schema",
        "json_schema": { "name": format.name, "schema": schema, "strict": strict },
    })
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_openai_tool(t: &ToolDefinition) -> OpenAiTool {
    OpenAiTool {
        r#type: "function".to_string(),
        function: OpenAiToolFunction {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        },
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<OpenAiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OpenAiPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiUrl },
    File { file: OpenAiFile },
}

#[derive(Debug, Serialize)]
struct OpenAiUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct OpenAiFile {
    file_data: String,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    r#type: String,
    function: OpenAiToolFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunctionCall {
    name: String,
    arguments: String,
}

fn to_openai_message(m: &ChatMessage, names: &ToolNameMap) -> OpenAiMessage {
    let role = match m.role {
        Role::System => "system",
        Role::Developer => "developer",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    OpenAiMessage {
        role,
        content: to_openai_content(&m.content),
        tool_calls: m
            .tool_calls
            .iter()
            .map(|tc| OpenAiToolCall {
                id: tc.id.clone(),
                r#type: "function".to_string(),
                function: OpenAiToolFunctionCall {
                    name: names.to_wire(&tc.name),
                    arguments: tc.arguments.clone(),
                },
            })
            .collect(),
        tool_call_id: m.tool_call_id.clone(),
    }
}

fn to_openai_content(content: &Content) -> Option<OpenAiContent> {
    match content {
        Content::Text(s) if s.is_empty() => None,
        Content::Text(s) => Some(OpenAiContent::Text(s.clone())),
        Content::Parts(parts) => Some(OpenAiContent::Parts(
            parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => OpenAiPart::Text { text: text.clone() },
                    ContentPart::Binary { mime_type, source } if p.is_image() => {
                        OpenAiPart::ImageUrl {
                            image_url: OpenAiUrl {
                                url: http::data_url(mime_type, source),
                            },
                        }
                    }
                    ContentPart::Binary { mime_type, source } => OpenAiPart::File {
                        file: OpenAiFile {
                            file_data: http::data_url(mime_type, source),
                        },
                    },
                })
                .collect(),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiChoiceToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceToolCall {
    id: String,
    #[serde(default)]
    function: OpenAiChoiceToolCallFunction,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiChoiceToolCallFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<OpenAiPromptDetails>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiPromptDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl From<OpenAiUsage> for Usage {
    fn from(u: OpenAiUsage) -> Self {
        let cached = u
            .prompt_tokens_details
            .map(|d| d.cached_tokens)
            .filter(|c| *c > 0);
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
            cached_tokens: cached,
            ..Default::default()
        }
        .normalized()
    }
}

impl TryFrom<OpenAiChatResponse> for ChatResponse {
    type Error = LlmError;

    fn try_from(v: OpenAiChatResponse) -> Result<Self> {
        let choice = v.choices.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat("openai response missing choices".to_string())
        })?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
            .collect();

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            reasoning: choice.message.reasoning_content.filter(|r| !r.is_empty()),
            tool_calls,
            usage: v.usage.map(Usage::from).unwrap_or_default(),
            finish_reason: choice.finish_reason,
            model: v.model,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponseChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    error: Option<OpenAiStreamError>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiStreamDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiStreamDeltaToolFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Argument fragments arrive keyed by `index`; calls are emitted whole once
/// the choice finishes.
pub(crate) struct OpenAiTranslator {
    names: ToolNameMap,
    tool_calls: BTreeMap<u32, PartialToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    done: bool,
}

impl OpenAiTranslator {
    pub(crate) fn new(names: ToolNameMap) -> Self {
        Self {
            names,
            tool_calls: BTreeMap::new(),
            usage: None,
            finish_reason: None,
            done: false,
        }
    }

    fn flush_tool_calls(&mut self) -> Option<ChatChunk> {
        if self.tool_calls.is_empty() {
            return None;
        }
        let calls: Vec<ToolCall> = std::mem::take(&mut self.tool_calls)
            .into_iter()
            .filter_map(|(index, partial)| {
                let Some(name) = partial.name else {
                    tracing::warn!(index, "openai tool call without a name; dropping");
                    return None;
                };
                let id = partial
                    .id
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                Some(ToolCall::new(id, self.names.from_wire(&name), partial.arguments))
            })
            .collect();
        (!calls.is_empty()).then(|| ChatChunk {
            tool_calls: Some(calls),
            ..Default::default()
        })
    }

    fn finish_chunks(&mut self) -> Vec<Result<ChatChunk>> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let mut out: Vec<Result<ChatChunk>> = self.flush_tool_calls().into_iter().map(Ok).collect();
        out.push(Ok(ChatChunk::done(
            self.finish_reason.take(),
            self.usage.take(),
        )));
        out
    }
}

impl Translator<SseEvent> for OpenAiTranslator {
    fn on_item(&mut self, event: SseEvent) -> Vec<Result<ChatChunk>> {
        if self.done {
            return Vec::new();
        }
        if event.is_done_sentinel() {
            return self.finish_chunks();
        }
        let Some(chunk) = parse_data::<OpenAiStreamResponseChunk>(NAME, &event.data) else {
            return Vec::new();
        };
        if let Some(err) = chunk.error {
            self.done = true;
            return vec![Err(LlmError::from_status(NAME, 500, &err.message))];
        }

        let mut out = Vec::new();
        if let Some(u) = chunk.usage {
            self.usage = Some(u.into());
        }

        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(text) = delta.reasoning_content.filter(|t| !t.is_empty()) {
                out.push(Ok(ChatChunk::reasoning(text)));
            }
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                out.push(Ok(ChatChunk::content(text)));
            }
            for tc in delta.tool_calls.unwrap_or_default() {
                let entry = self.tool_calls.entry(tc.index.unwrap_or(0)).or_default();
                if entry.id.is_none() {
                    entry.id = tc.id;
                }
                if let Some(f) = tc.function {
                    if entry.name.is_none() {
                        entry.name = f.name;
                    }
                    if let Some(args) = f.arguments {
                        entry.arguments.push_str(&args);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
                out.extend(self.flush_tool_calls().map(Ok));
            }
        }
        out
    }

    /// Streams that close without `[DONE]` still terminate with a done chunk.
    fn finish(&mut self) -> Vec<Result<ChatChunk>> {
        self.finish_chunks()
    }
}
