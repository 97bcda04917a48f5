//! Google Generative Language API (`generateContent` / `streamGenerateContent`).

use crate::error::{LlmError, Result};
use crate::http;
use crate::provider::{Capabilities, ChatRequest, ChunkStream, Provider, ProviderConfig};
use crate::sse::{SseDecoder, SseEvent, parse_data};
use crate::stream::{Translator, pump};
use crate::types::{
    BinarySource, ChatChunk, ChatMessage, ChatResponse, ContentPart, Role, ToolCall, Usage,
    split_system_messages,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;

pub const NAME: &str = "gemini";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// JSON Schema keywords the Gemini schema dialect rejects.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "$defs",
    "$ref",
    "definitions",
    "additionalProperties",
    "examples",
    "default",
];

pub struct GeminiProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            http: config.http_client(),
            api_key: config.require_api_key(NAME)?,
            base_url: config.base_url_or(DEFAULT_BASE_URL),
        })
    }

    async fn send(
        &self,
        url: String,
        body: &GeminiRequest,
        request: &ChatRequest,
    ) -> Result<reqwest::Response> {
        let builder = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body);
        http::send(NAME, builder, request).await
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self, model: &str) -> Capabilities {
        Capabilities {
            vision: true,
            native_schema: true,
            reasoning: model.contains("2.5") || model.contains("thinking"),
            ..Capabilities::default()
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/models/{}:generateContent", self.base_url, request.model);
        let body = GeminiRequest::new(request);
        let response = self.send(url, &body, request).await?;
        let parsed: GeminiResponse = http::read_json(response, request).await?;
        parsed.into_chat_response()
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, request.model
        );
        let body = GeminiRequest::new(request);
        let response = self.send(url, &body, request).await?;
        Ok(pump(
            response.bytes_stream(),
            SseDecoder::new(),
            GeminiTranslator::default(),
        ))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Value>,
}

impl GeminiRequest {
    fn new(request: &ChatRequest) -> Self {
        let (instructions, turns) = split_system_messages(&request.messages);
        let system = instructions
            .iter()
            .map(ChatMessage::text)
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        // functionResponse parts must name the function; results only carry the call id.
        let mut call_names: HashMap<&str, &str> = HashMap::new();
        for m in &turns {
            for tc in &m.tool_calls {
                call_names.insert(&tc.id, &tc.name);
            }
        }

        let mut contents: Vec<GeminiContent> = Vec::new();
        for m in &turns {
            let (role, parts) = match m.role {
                Role::Assistant => ("model", model_parts(m)),
                Role::Tool => {
                    let name = m
                        .tool_call_id
                        .as_deref()
                        .and_then(|id| call_names.get(id).copied())
                        .unwrap_or("tool");
                    ("user", vec![function_response_part(name, &m.text())])
                }
                _ => ("user", user_parts(m)),
            };
            if parts.is_empty() {
                continue;
            }
            match contents.last_mut() {
                Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
                _ => contents.push(GeminiContent {
                    role: Some(role.to_string()),
                    parts,
                }),
            }
        }

        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": strip_unsupported(t.parameters.clone()),
                    })
                })
                .collect();
            vec![json!({ "functionDeclarations": declarations })]
        };

        let mut config = serde_json::Map::new();
        if let Some(t) = request.temperature {
            config.insert("temperature".to_string(), json!(t));
        }
        if let Some(max) = request.max_tokens {
            config.insert("maxOutputTokens".to_string(), json!(max));
        }
        if let Some(format) = &request.response_format {
            config.insert("responseMimeType".to_string(), json!("application/json"));
            config.insert(
                "responseSchema".to_string(),
                strip_unsupported(format.schema.clone()),
            );
        }

        Self {
            contents,
            system_instruction: (!system.is_empty()).then(|| GeminiContent {
                role: None,
                parts: vec![json!({ "text": system })],
            }),
            tools,
            generation_config: (!config.is_empty()).then_some(Value::Object(config)),
        }
    }
}

fn user_parts(m: &ChatMessage) -> Vec<Value> {
    m.content
        .parts()
        .into_iter()
        .map(|p| match p {
            ContentPart::Text { text } => json!({ "text": text }),
            ContentPart::Binary {
                mime_type,
                source: BinarySource::Base64(data),
            } => json!({ "inlineData": { "mimeType": mime_type, "data": data } }),
            ContentPart::Binary {
                mime_type,
                source: BinarySource::Url(uri),
            } => json!({ "fileData": { "mimeType": mime_type, "fileUri": uri } }),
        })
        .collect()
}

fn model_parts(m: &ChatMessage) -> Vec<Value> {
    let mut parts = Vec::new();
    let text = m.text();
    if !text.is_empty() {
        parts.push(json!({ "text": text }));
    }
    for tc in &m.tool_calls {
        let args = tc.parse_arguments().unwrap_or_else(|_| json!({}));
        parts.push(json!({ "functionCall": { "name": tc.name, "args": args } }));
    }
    parts
}

/// `response` must be an object; non-object results are wrapped.
fn function_response_part(name: &str, result: &str) -> Value {
    let response = match serde_json::from_str::<Value>(result) {
        Ok(Value::Object(obj)) => Value::Object(obj),
        Ok(other) => json!({ "result": other }),
        Err(_) => json!({ "result": result }),
    };
    json!({ "functionResponse": { "name": name, "response": response } })
}

fn strip_unsupported(value: Value) -> Value {
    match value {
        Value::Object(obj) => Value::Object(
            obj.into_iter()
                .filter(|(k, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k, strip_unsupported(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_unsupported).collect()),
        other => other,
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    thoughts_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
    #[serde(default)]
    cached_content_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

impl From<GeminiUsage> for Usage {
    fn from(u: GeminiUsage) -> Self {
        Usage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count + u.thoughts_token_count,
            total_tokens: u.total_token_count,
            cached_tokens: u.cached_content_token_count.filter(|c| *c > 0),
            ..Default::default()
        }
        .normalized()
    }
}

#[derive(Debug, Default)]
struct Extracted {
    text: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
}

/// Gemini has no call ids; one is synthesized per function call.
fn extract_parts(parts: &[Value]) -> Extracted {
    let mut out = Extracted::default();
    for part in parts {
        if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            out.tool_calls.push(ToolCall::new(
                format!("call_{}", uuid::Uuid::new_v4().simple()),
                name,
                args.to_string(),
            ));
            continue;
        }
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if part.get("thought").and_then(Value::as_bool) == Some(true) {
                out.reasoning.push_str(text);
            } else {
                out.text.push_str(text);
            }
        }
    }
    out
}

impl GeminiResponse {
    fn into_chat_response(self) -> Result<ChatResponse> {
        if let Some(err) = self.error {
            return Err(LlmError::from_status(NAME, err.code, &err.message));
        }
        let candidate = self.candidates.into_iter().next().ok_or_else(|| {
            LlmError::ResponseFormat("gemini response missing candidates".to_string())
        })?;
        let extracted = extract_parts(&candidate.content.parts);
        Ok(ChatResponse {
            content: extracted.text,
            reasoning: (!extracted.reasoning.is_empty()).then_some(extracted.reasoning),
            tool_calls: extracted.tool_calls,
            usage: self.usage_metadata.map(Usage::from).unwrap_or_default(),
            finish_reason: candidate.finish_reason,
            model: self.model_version,
        })
    }
}

/// Every SSE event is a complete response fragment; usage is cumulative, so
/// the last report wins.
#[derive(Debug, Default)]
pub(crate) struct GeminiTranslator {
    usage: Option<GeminiUsage>,
    finish_reason: Option<String>,
    done: bool,
}

impl Translator<SseEvent> for GeminiTranslator {
    fn on_item(&mut self, event: SseEvent) -> Vec<Result<ChatChunk>> {
        if self.done {
            return Vec::new();
        }
        let Some(parsed) = parse_data::<GeminiResponse>(NAME, &event.data) else {
            return Vec::new();
        };
        if let Some(err) = parsed.error {
            self.done = true;
            return vec![Err(LlmError::from_status(NAME, err.code, &err.message))];
        }
        if let Some(u) = parsed.usage_metadata {
            self.usage = Some(u);
        }

        let mut out = Vec::new();
        for candidate in parsed.candidates {
            let extracted = extract_parts(&candidate.content.parts);
            if !extracted.reasoning.is_empty() {
                out.push(Ok(ChatChunk::reasoning(extracted.reasoning)));
            }
            if !extracted.text.is_empty() {
                out.push(Ok(ChatChunk::content(extracted.text)));
            }
            if !extracted.tool_calls.is_empty() {
                out.push(Ok(ChatChunk {
                    tool_calls: Some(extracted.tool_calls),
                    ..Default::default()
                }));
            }
            if candidate.finish_reason.is_some() {
                self.finish_reason = candidate.finish_reason;
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<Result<ChatChunk>> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![Ok(ChatChunk::done(
            self.finish_reason.take(),
            self.usage.take().map(Usage::from),
        ))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ResponseFormat, Schema};
    use crate::types::ToolDefinition;

    fn event(data: Value) -> SseEvent {
        SseEvent {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn function_responses_are_named_from_the_matching_call() {
        let mut assistant = ChatMessage::assistant("");
        assistant.tool_calls = vec![ToolCall::new("call_9", "get_weather", r#"{"city":"Oslo"}"#)];
        let request = ChatRequest::new(
            "gemini-2.0-flash",
            vec![
                ChatMessage::system("sys"),
                ChatMessage::user("weather?"),
                assistant,
                ChatMessage::tool_result("call_9", r#"{"temp":3}"#),
                ChatMessage::tool_result("call_x", "plain text"),
            ],
        );
        let wire = serde_json::to_value(GeminiRequest::new(&request)).unwrap();
        assert_eq!(wire["systemInstruction"]["parts"][0]["text"], "sys");
        let contents = wire["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"]["city"], "Oslo");
        let responses = contents[2]["parts"].as_array().unwrap();
        assert_eq!(responses[0]["functionResponse"]["name"], "get_weather");
        assert_eq!(responses[0]["functionResponse"]["response"]["temp"], 3);
        assert_eq!(responses[1]["functionResponse"]["response"]["result"], "plain text");
    }

    #[test]
    fn schemas_are_stripped_of_unsupported_keywords() {
        let tool = ToolDefinition {
            name: "t".to_string(),
            description: "d".to_string(),
            parameters: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": { "n": { "type": "integer", "default": 1 } }
            }),
        };
        let request = ChatRequest::new("gemini-2.0-flash", vec![ChatMessage::user("x")])
            .with_tools(vec![tool])
            .with_response_format(ResponseFormat::from_schema(&Schema::json(json!({
                "$schema": "x",
                "properties": { "a": { "type": "string" } },
                "additionalProperties": false
            }))));
        let wire = serde_json::to_value(GeminiRequest::new(&request)).unwrap();
        let params = &wire["tools"][0]["functionDeclarations"][0]["parameters"];
        assert!(params.get("additionalProperties").is_none());
        assert!(params["properties"]["n"].get("default").is_none());
        let config = &wire["generationConfig"];
        assert_eq!(config["responseMimeType"], "application/json");
        assert!(config["responseSchema"].get("additionalProperties").is_none());
        assert_eq!(config["responseSchema"]["type"], "object");
    }

    #[test]
    fn stream_fragments_map_to_chunks_and_last_usage_wins() {
        let mut t = GeminiTranslator::default();
        let mut chunks = Vec::new();
        for data in [
            json!({"candidates":[{"content":{"role":"model","parts":[{"text":"pondering","thought":true}]}}]}),
            json!({"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":1}}),
            json!({"candidates":[{"content":{"role":"model","parts":[{"text":"lo"},{"functionCall":{"name":"f","args":{"k":true}}}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":6,"thoughtsTokenCount":2,"totalTokenCount":12}}),
        ] {
            chunks.extend(t.on_item(event(data)).into_iter().map(Result::unwrap));
        }
        chunks.extend(t.finish().into_iter().map(Result::unwrap));

        assert_eq!(chunks[0].reasoning.as_deref(), Some("pondering"));
        let text: String = chunks.iter().filter_map(|c| c.content.clone()).collect();
        assert_eq!(text, "Hello");
        let call = chunks
            .iter()
            .find_map(|c| c.tool_calls.as_ref())
            .map(|calls| calls[0].clone())
            .unwrap();
        assert_eq!(call.name, "f");
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.arguments, r#"{"k":true}"#);

        let done = chunks.last().unwrap();
        assert!(done.done);
        assert_eq!(done.finish_reason.as_deref(), Some("STOP"));
        let usage = done.usage.as_ref().unwrap();
        assert_eq!(usage.input_tokens, 4);
        assert_eq!(usage.output_tokens, 8);
        assert_eq!(usage.total_tokens, 12);
    }

    #[test]
    fn error_payload_is_classified() {
        let mut t = GeminiTranslator::default();
        let out = t.on_item(event(json!({
            "error": { "code": 429, "message": "Resource exhausted", "status": "RESOURCE_EXHAUSTED" }
        })));
        assert!(matches!(out[0], Err(LlmError::RateLimited { .. })));

        let parsed: GeminiResponse =
            serde_json::from_value(json!({ "error": { "code": 403, "message": "denied" } })).unwrap();
        assert!(parsed.into_chat_response().unwrap_err().is_auth());
    }
}
