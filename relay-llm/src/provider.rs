use crate::error::{LlmError, Result};
use crate::schema::ResponseFormat;
use crate::types::{ChatChunk, ChatMessage, ChatResponse, ToolDefinition};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

/// What a backend can do for a given model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub streaming: bool,
    pub tools: bool,
    pub vision: bool,
    pub structured_output: bool,
    /// The backend enforces a JSON Schema itself; otherwise the schema is
    /// also spelled out in the system prompt.
    pub native_schema: bool,
    pub reasoning: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            tools: true,
            vision: false,
            structured_output: true,
            native_schema: false,
            reasoning: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub response_format: Option<ResponseFormat>,
    pub headers: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
            response_format: None,
            headers: BTreeMap::new(),
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
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

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// The contract every backend implements.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name: "openai", "anthropic", "gemini", "bedrock".
    fn name(&self) -> &str;

    fn capabilities(&self, model: &str) -> Capabilities;

    /// Single-shot completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Incremental completion. Backends without streaming keep the default.
    async fn stream(&self, _request: &ChatRequest) -> Result<ChunkStream> {
        Err(LlmError::Unsupported(format!(
            "{} does not support streaming",
            self.name()
        )))
    }
}

/// Settings handed to a registry factory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl ProviderConfig {
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Default::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub(crate) fn require_api_key(&self, provider: &str) -> Result<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidInput(format!("{provider}: api_key is required")))
    }

    pub(crate) fn base_url_or(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }

    pub fn http_client(&self) -> reqwest::Client {
        let mut defaults = reqwest::header::HeaderMap::new();
        for (name, value) in &self.headers {
            match (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    defaults.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "skipping invalid default header"),
            }
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .default_headers(defaults);
        if let Some(secs) = self.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        builder.build().unwrap_or_else(|e| {
            tracing::warn!(%e, "reqwest client build failed; falling back to default client");
            reqwest::Client::new()
        })
    }
}

/// Decorator that logs every call made through the wrapped provider.
///
/// Install it as the registry interceptor with
/// `registry.install_interceptor(Arc::new(TracedProvider::wrap))`.
pub struct TracedProvider {
    inner: Arc<dyn Provider>,
}

impl TracedProvider {
    pub fn wrap(inner: Arc<dyn Provider>) -> Arc<dyn Provider> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl Provider for TracedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self, model: &str) -> Capabilities {
        self.inner.capabilities(model)
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let started = Instant::now();
        tracing::info!(
            provider = %self.inner.name(),
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "provider chat started"
        );
        let result = self.inner.chat(request).await;
        match &result {
            Ok(response) => tracing::info!(
                provider = %self.inner.name(),
                model = %request.model,
                latency_ms = started.elapsed().as_millis() as u64,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                tool_calls = response.tool_calls.len(),
                "provider chat completed"
            ),
            Err(e) => tracing::warn!(
                provider = %self.inner.name(),
                model = %request.model,
                error = %e,
                "provider chat failed"
            ),
        }
        result
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let started = Instant::now();
        let provider = self.inner.name().to_string();
        let model = request.model.clone();
        tracing::info!(provider = %provider, model = %model, "provider stream opened");
        let stream = self.inner.stream(request).await?;
        let mut chunks = 0usize;
        Ok(Box::pin(stream.inspect(move |item| {
            chunks += 1;
            match item {
                Ok(chunk) if chunk.done => tracing::info!(
                    provider = %provider,
                    model = %model,
                    chunks,
                    latency_ms = started.elapsed().as_millis() as u64,
                    finish_reason = ?chunk.finish_reason,
                    "provider stream completed"
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    provider = %provider,
                    model = %model,
                    error = %e,
                    "provider stream item failed"
                ),
            }
        })))
    }
}
