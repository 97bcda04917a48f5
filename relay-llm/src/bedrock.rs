//! AWS Bedrock Converse API. Requests are SigV4-signed; streaming responses
//! arrive as binary event-stream frames.

use crate::error::{LlmError, Result};
use crate::eventstream::{Frame, FrameDecoder};
use crate::http;
use crate::provider::{Capabilities, ChatRequest, ChunkStream, Provider, ProviderConfig};
use crate::sigv4::{self, Credentials, SigningParams};
use crate::stream::{Translator, pump};
use crate::types::{
    BinarySource, ChatChunk, ChatMessage, ChatResponse, ContentPart, Role, ToolCall, Usage,
    split_system_messages,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;

pub const NAME: &str = "bedrock";
const SERVICE: &str = "bedrock";
const DEFAULT_REGION: &str = "us-east-1";
const EVENT_STREAM_MIME: &str = "application/vnd.amazon.eventstream";

pub struct BedrockProvider {
    http: reqwest::Client,
    credentials: Credentials,
    region: String,
    base_url: String,
}

impl BedrockProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let access_key_id = config
            .access_key_id
            .clone()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| LlmError::InvalidInput("bedrock: access_key_id is required".into()))?;
        let secret_access_key = config
            .secret_access_key
            .clone()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                LlmError::InvalidInput("bedrock: secret_access_key is required".into())
            })?;
        let region = config
            .region
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let base_url =
            config.base_url_or(&format!("https://bedrock-runtime.{region}.amazonaws.com"));

        Ok(Self {
            http: config.http_client(),
            credentials: Credentials {
                access_key_id,
                secret_access_key,
                session_token: config.session_token.clone(),
            },
            region,
            base_url,
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(operation = %operation))]
    async fn send(
        &self,
        operation: &str,
        body: &Value,
        request: &ChatRequest,
        accept: &str,
    ) -> Result<reqwest::Response> {
        let url = format!(
            "{}/model/{}/{operation}",
            self.base_url,
            sigv4::uri_encode(&request.model)
        );
        let bytes = serde_json::to_vec(body)?;
        let signed = sigv4::sign(
            &self.credentials,
            &SigningParams {
                method: "POST",
                url: &url,
                body: &bytes,
                region: &self.region,
                service: SERVICE,
                timestamp: chrono::Utc::now(),
                include_content_sha256: true,
            },
        )?;

        let mut builder = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, accept);
        for (name, value) in signed.to_pairs() {
            builder = builder.header(name, value);
        }
        http::send(NAME, builder.body(bytes), request).await
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self, model: &str) -> Capabilities {
        let m = model.to_ascii_lowercase();
        Capabilities {
            vision: m.contains("anthropic.claude-3")
                || m.contains("claude-sonnet-4")
                || m.contains("claude-opus-4")
                || m.contains("nova-pro")
                || m.contains("nova-lite"),
            native_schema: false,
            reasoning: m.contains("3-7") || m.contains("-4-") || m.contains("deepseek.r1"),
            ..Capabilities::default()
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = converse_body(request)?;
        let response = self
            .send("converse", &body, request, "application/json")
            .await?;
        let parsed: ConverseResponse = http::read_json(response, request).await?;
        Ok(parsed.into())
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let body = converse_body(request)?;
        let response = self
            .send("converse-stream", &body, request, EVENT_STREAM_MIME)
            .await?;
        Ok(pump(
            response.bytes_stream(),
            FrameDecoder::new(),
            BedrockTranslator::default(),
        ))
    }
}

fn converse_body(request: &ChatRequest) -> Result<Value> {
    let (instructions, turns) = split_system_messages(&request.messages);

    let mut messages: Vec<Value> = Vec::new();
    let mut last_role = "";
    for m in &turns {
        let (role, blocks) = match m.role {
            Role::Assistant => ("assistant", assistant_blocks(m)),
            Role::Tool => ("user", vec![tool_result_block(m)]),
            _ => ("user", user_blocks(m)?),
        };
        if blocks.is_empty() {
            continue;
        }
        // Converse rejects consecutive turns with the same role.
        if role == last_role {
            if let Some(content) = messages
                .last_mut()
                .and_then(|msg| msg.get_mut("content"))
                .and_then(Value::as_array_mut)
            {
                content.extend(blocks);
                continue;
            }
        }
        messages.push(json!({ "role": role, "content": blocks }));
        last_role = role;
    }

    let mut body = json!({ "messages": messages });
    let system: Vec<Value> = instructions
        .iter()
        .map(ChatMessage::text)
        .filter(|t| !t.trim().is_empty())
        .map(|t| json!({ "text": t }))
        .collect();
    if !system.is_empty() {
        body["system"] = Value::Array(system);
    }

    let mut inference = serde_json::Map::new();
    if let Some(max) = request.max_tokens {
        inference.insert("maxTokens".to_string(), json!(max));
    }
    if let Some(t) = request.temperature {
        inference.insert("temperature".to_string(), json!(t));
    }
    if !inference.is_empty() {
        body["inferenceConfig"] = Value::Object(inference);
    }

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({ "toolSpec": {
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": { "json": t.parameters },
                }})
            })
            .collect();
        body["toolConfig"] = json!({ "tools": tools });
    }

    Ok(body)
}

fn user_blocks(m: &ChatMessage) -> Result<Vec<Value>> {
    let mut doc_index = 0;
    m.content
        .parts()
        .into_iter()
        .map(|p| match p {
            ContentPart::Text { text } => Ok(json!({ "text": text })),
            ContentPart::Binary {
                source: BinarySource::Url(url),
                ..
            } => Err(LlmError::Unsupported(format!(
                "bedrock needs inline bytes for attachments, got a reference: {url}"
            ))),
            ContentPart::Binary {
                mime_type,
                source: BinarySource::Base64(data),
            } => {
                let format = mime_type
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                if mime_type.starts_with("image/") {
                    Ok(json!({ "image": { "format": format, "source": { "bytes": data } } }))
                } else {
                    doc_index += 1;
                    Ok(json!({ "document": {
                        "format": document_format(&mime_type),
                        "name": format!("document-{doc_index}"),
                        "source": { "bytes": data },
                    }}))
                }
            }
        })
        .collect()
}

fn document_format(mime_type: &str) -> &'static str {
    match mime_type {
        "application/pdf" => "pdf",
        "text/csv" => "csv",
        "text/html" => "html",
        "text/markdown" => "md",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        _ => "txt",
    }
}

fn assistant_blocks(m: &ChatMessage) -> Vec<Value> {
    let mut blocks = Vec::new();
    let text = m.text();
    if !text.trim().is_empty() {
        blocks.push(json!({ "text": text }));
    }
    for tc in &m.tool_calls {
        let input = tc.parse_arguments().unwrap_or_else(|_| json!({}));
        blocks.push(json!({ "toolUse": {
            "toolUseId": tc.id,
            "name": tc.name,
            "input": input,
        }}));
    }
    blocks
}

fn tool_result_block(m: &ChatMessage) -> Value {
    let text = m.text();
    let content = match serde_json::from_str::<Value>(&text) {
        Ok(v @ Value::Object(_)) => json!({ "json": v }),
        _ => json!({ "text": text }),
    };
    json!({ "toolResult": {
        "toolUseId": m.tool_call_id.clone().unwrap_or_default(),
        "content": [content],
    }})
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
struct BedrockUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_write_input_tokens: Option<u64>,
}

impl From<BedrockUsage> for Usage {
    fn from(u: BedrockUsage) -> Self {
        let cached = u.cache_read_input_tokens.filter(|c| *c > 0);
        let creation = u.cache_write_input_tokens.filter(|c| *c > 0);
        let input = u.input_tokens + cached.unwrap_or(0) + creation.unwrap_or(0);
        Usage {
            input_tokens: input,
            output_tokens: u.output_tokens,
            total_tokens: u.total_tokens.max(input + u.output_tokens),
            cached_tokens: cached,
            cache_creation_tokens: creation,
            cost: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseResponse {
    #[serde(default)]
    output: Option<ConverseOutput>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: BedrockUsage,
}

#[derive(Debug, Deserialize)]
struct ConverseOutput {
    #[serde(default)]
    message: Option<ConverseMessage>,
}

#[derive(Debug, Deserialize)]
struct ConverseMessage {
    #[serde(default)]
    content: Vec<Value>,
}

impl From<ConverseResponse> for ChatResponse {
    fn from(v: ConverseResponse) -> Self {
        let blocks = v
            .output
            .and_then(|o| o.message)
            .map(|m| m.content)
            .unwrap_or_default();

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();
        for block in &blocks {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                content.push_str(text);
            } else if let Some(tool) = block.get("toolUse") {
                let field = |k: &str| tool.get(k).and_then(Value::as_str).unwrap_or_default();
                let input = tool.get("input").cloned().unwrap_or_else(|| json!({}));
                tool_calls.push(ToolCall::new(
                    field("toolUseId"),
                    field("name"),
                    input.to_string(),
                ));
            } else if let Some(text) = block
                .pointer("/reasoningContent/reasoningText/text")
                .and_then(Value::as_str)
            {
                reasoning.push_str(text);
            }
        }

        ChatResponse {
            content,
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            tool_calls,
            usage: v.usage.into(),
            finish_reason: v.stop_reason,
            model: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StreamPayload {
    #[serde(default)]
    content_block_index: Option<u32>,
    #[serde(default)]
    start: Option<Value>,
    #[serde(default)]
    delta: Option<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<BedrockUsage>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl StreamPayload {
    /// Event kind when the `:event-type` header is missing.
    fn sniff_kind(&self) -> &'static str {
        if self.delta.is_some() {
            "contentBlockDelta"
        } else if self.start.is_some() {
            "contentBlockStart"
        } else if self.stop_reason.is_some() {
            "messageStop"
        } else if self.usage.is_some() {
            "metadata"
        } else if self.role.is_some() {
            "messageStart"
        } else if self.content_block_index.is_some() {
            "contentBlockStop"
        } else {
            "unknown"
        }
    }
}

#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    input: String,
}

/// Per-stream state; pending tool input is keyed by content block index and
/// dropped when its block stops.
#[derive(Debug, Default)]
pub(crate) struct BedrockTranslator {
    tools: HashMap<u32, PendingToolUse>,
    stop_reason: Option<String>,
    usage: Option<BedrockUsage>,
    done: bool,
}

impl BedrockTranslator {
    fn exception(&mut self, frame: &Frame, payload: &StreamPayload) -> LlmError {
        self.done = true;
        self.tools.clear();
        let kind = frame
            .header(":exception-type")
            .or_else(|| frame.header(":error-code"))
            .unwrap_or("unknownException");
        let message = payload
            .message
            .clone()
            .or_else(|| frame.header(":error-message").map(str::to_string))
            .unwrap_or_default();
        tracing::warn!(kind, %message, "bedrock stream exception");
        exception_error(kind, &message)
    }

    fn done_chunk(&mut self) -> Vec<Result<ChatChunk>> {
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
            self.usage.take().map(Usage::from),
        ))]
    }
}

fn exception_error(kind: &str, message: &str) -> LlmError {
    let status = match kind {
        "throttlingException" => 429,
        "accessDeniedException" | "unrecognizedClientException" => 403,
        "validationException" => 400,
        "resourceNotFoundException" => 404,
        "serviceUnavailableException" => 503,
        "modelTimeoutException" => return LlmError::Timeout,
        _ => 500,
    };
    LlmError::from_status(NAME, status, &format!("{kind}: {message}"))
}

impl Translator<Frame> for BedrockTranslator {
    fn on_item(&mut self, frame: Frame) -> Vec<Result<ChatChunk>> {
        if self.done {
            return Vec::new();
        }
        let payload: StreamPayload = match serde_json::from_slice(&frame.payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    event_type = ?frame.event_type(),
                    payload_len = frame.payload.len(),
                    "skipping malformed event-stream payload"
                );
                return Vec::new();
            }
        };

        if matches!(frame.message_type(), Some("exception") | Some("error")) {
            return vec![Err(self.exception(&frame, &payload))];
        }

        let kind = frame
            .event_type()
            .map(str::to_string)
            .unwrap_or_else(|| payload.sniff_kind().to_string());
        let index = payload.content_block_index.unwrap_or(0);

        match kind.as_str() {
            "messageStart" => Vec::new(),
            "contentBlockStart" => {
                if let Some(tool) = payload.start.as_ref().and_then(|s| s.get("toolUse")) {
                    let field = |k: &str| {
                        tool.get(k)
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string()
                    };
                    self.tools.insert(
                        index,
                        PendingToolUse {
                            id: field("toolUseId"),
                            name: field("name"),
                            input: String::new(),
                        },
                    );
                }
                Vec::new()
            }
            "contentBlockDelta" => {
                let Some(delta) = payload.delta else {
                    return Vec::new();
                };
                if let Some(text) = delta.get("text").and_then(Value::as_str) {
                    return if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![Ok(ChatChunk::content(text))]
                    };
                }
                if let Some(text) = delta
                    .pointer("/reasoningContent/text")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                {
                    return vec![Ok(ChatChunk::reasoning(text))];
                }
                if let Some(input) = delta.pointer("/toolUse/input").and_then(Value::as_str) {
                    match self.tools.get_mut(&index) {
                        Some(pending) => pending.input.push_str(input),
                        None => tracing::warn!(index, "tool input delta for unknown block"),
                    }
                }
                Vec::new()
            }
            "contentBlockStop" => match self.tools.remove(&index) {
                Some(p) => {
                    let args = if p.input.trim().is_empty() {
                        "{}".to_string()
                    } else {
                        p.input
                    };
                    vec![Ok(ChatChunk::tool_call(ToolCall::new(p.id, p.name, args)))]
                }
                None => Vec::new(),
            },
            "messageStop" => {
                self.stop_reason = payload.stop_reason;
                Vec::new()
            }
            "metadata" => {
                self.usage = payload.usage;
                self.done_chunk()
            }
            other => {
                tracing::debug!(event_type = other, "ignoring event-stream event");
                Vec::new()
            }
        }
    }

    fn finish(&mut self) -> Vec<Result<ChatChunk>> {
        self.done_chunk()
    }
}
