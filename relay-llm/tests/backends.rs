use futures_util::StreamExt;
use relay_llm::{
    AnthropicProvider, BedrockProvider, ChatChunk, ChatMessage, ChatRequest, GeminiProvider,
    LlmError, OpenAiProvider, Provider, ProviderConfig, ResponseFormat, Schema, ToolDefinition,
};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> ProviderConfig {
    ProviderConfig::with_api_key("test-key").with_base_url(server.uri())
}

fn sse(events: &[serde_json::Value]) -> String {
    events.iter().map(|e| format!("data: {e}\n\n")).collect()
}

async fn collect(provider: &dyn Provider, request: &ChatRequest) -> Vec<ChatChunk> {
    provider
        .stream(request)
        .await
        .unwrap()
        .map(|c| c.unwrap())
        .collect()
        .await
}

fn weather_tool() -> ToolDefinition {
    ToolDefinition::validated(
        "get_weather",
        "Current weather for a city",
        &Schema::json(json!({
            "type": "object",
            "properties": { "city": { "type": "string" } },
            "required": ["city"]
        })),
    )
    .unwrap()
}

#[tokio::test]
async fn openai_chat_sends_bearer_auth_and_maps_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "messages": [{ "role": "user", "content": "hi" }],
            "tools": [{ "type": "function", "function": { "name": "get_weather" } }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "get_weather", "arguments": "{\"city\":\"Oslo\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 7, "total_tokens": 19 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(&config(&server)).unwrap();
    let request = ChatRequest::new("gpt-4o-mini", vec![ChatMessage::user("hi")])
        .with_tools(vec![weather_tool()]);
    let response = provider.chat(&request).await.unwrap();

    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].name, "get_weather");
    assert_eq!(response.tool_calls[0].parse_arguments().unwrap()["city"], "Oslo");
    assert_eq!(response.usage.total_tokens, 19);
    assert_eq!(response.finish_reason.as_deref(), Some("tool_calls"));
}

#[tokio::test]
async fn openai_stream_assembles_content_and_single_done_chunk() {
    let server = MockServer::start().await;
    let body = sse(&[
        json!({ "choices": [{ "index": 0, "delta": { "content": "Hel" } }] }),
        json!({ "choices": [{ "index": 0, "delta": { "content": "lo" }, "finish_reason": "stop" }] }),
        json!({ "choices": [], "usage": { "prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5 } }),
    ]) + "data: [DONE]\n\n";
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "stream": true, "stream_options": { "include_usage": true } })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(&config(&server)).unwrap();
    let chunks = collect(&provider, &ChatRequest::new("gpt-4o", vec![ChatMessage::user("hi")])).await;

    let text: String = chunks.iter().filter_map(|c| c.content.clone()).collect();
    assert_eq!(text, "Hello");
    assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    assert!(chunks.last().unwrap().done);
    let usage = chunks.iter().rev().find_map(|c| c.usage.clone()).unwrap();
    assert_eq!(usage.total_tokens, 5);
}

#[tokio::test]
async fn openai_native_schema_is_sent_as_json_schema_response_format() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "response_format": { "type": "json_schema", "json_schema": { "name": "answer", "strict": true } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "{\"n\":1}" }, "finish_reason": "stop" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let format = ResponseFormat::from_schema(&Schema::json(json!({
        "title": "answer",
        "type": "object",
        "properties": { "n": { "type": "integer" } }
    })));
    let provider = OpenAiProvider::new(&config(&server)).unwrap();
    let request = ChatRequest::new("gpt-4o", vec![ChatMessage::user("n?")]).with_response_format(format);
    let response = provider.chat(&request).await.unwrap();
    assert_eq!(response.content, "{\"n\":1}");
}

#[tokio::test]
async fn error_statuses_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "limited" })))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "locked" })))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "small" })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": "context_length_exceeded", "message": "maximum context length is 8192 tokens" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({ "model": "down" })))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(&config(&server)).unwrap();
    let ask = |model: &str| ChatRequest::new(model, vec![ChatMessage::user("hi")]);

    match provider.chat(&ask("limited")).await {
        Err(LlmError::RateLimited { retry_after, .. }) => {
            assert_eq!(retry_after, Some(Duration::from_secs(7)))
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    let err = provider.chat(&ask("locked")).await.unwrap_err();
    assert!(err.is_auth());
    assert_eq!(err.status(), Some(401));
    assert!(matches!(
        provider.chat(&ask("small")).await,
        Err(LlmError::ContextLengthExceeded(_))
    ));
    let err = provider.stream(&ask("down")).await.err().unwrap();
    assert!(matches!(err, LlmError::Server { status: 503, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn request_timeout_and_cancellation_abort_the_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(2))
                .set_body_json(json!({ "choices": [] })),
        )
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(&config(&server)).unwrap();
    let request = ChatRequest::new("gpt-4o", vec![ChatMessage::user("hi")])
        .with_timeout(Duration::from_millis(100));
    assert!(matches!(provider.chat(&request).await, Err(LlmError::Timeout)));

    let request = ChatRequest::new("gpt-4o", vec![ChatMessage::user("hi")]);
    let cancel = request.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    assert!(matches!(provider.chat(&request).await, Err(LlmError::Cancelled)));
}

#[tokio::test]
async fn cancellation_interrupts_a_stalled_error_body() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;
        let head = "HTTP/1.1 500 Internal Server Error\r\n\
                    content-type: application/json\r\n\
                    content-length: 4096\r\n\r\n{\"error\":";
        socket.write_all(head.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let provider = OpenAiProvider::new(
        &ProviderConfig::with_api_key("test-key").with_base_url(format!("http://{addr}")),
    )
    .unwrap();
    let request = ChatRequest::new("gpt-4o", vec![ChatMessage::user("hi")]);
    let cancel = request.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = std::time::Instant::now();
    let result = provider.chat(&request).await;
    assert!(matches!(result, Err(LlmError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn anthropic_stream_maps_thinking_text_and_tool_use() {
    let server = MockServer::start().await;
    let body = sse(&[
        json!({ "type": "message_start", "message": { "model": "claude-sonnet-4", "usage": { "input_tokens": 20, "output_tokens": 1, "cache_read_input_tokens": 5 } } }),
        json!({ "type": "content_block_start", "index": 0, "content_block": { "type": "thinking", "thinking": "" } }),
        json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "thinking_delta", "thinking": "hmm" } }),
        json!({ "type": "content_block_stop", "index": 0 }),
        json!({ "type": "content_block_start", "index": 1, "content_block": { "type": "text", "text": "" } }),
        json!({ "type": "content_block_delta", "index": 1, "delta": { "type": "text_delta", "text": "Checking." } }),
        json!({ "type": "content_block_stop", "index": 1 }),
        json!({ "type": "content_block_start", "index": 2, "content_block": { "type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {} } }),
        json!({ "type": "content_block_delta", "index": 2, "delta": { "type": "input_json_delta", "partial_json": "{\"city\":" } }),
        json!({ "type": "content_block_delta", "index": 2, "delta": { "type": "input_json_delta", "partial_json": "\"Oslo\"}" } }),
        json!({ "type": "content_block_stop", "index": 2 }),
        json!({ "type": "message_delta", "delta": { "stop_reason": "tool_use" }, "usage": { "output_tokens": 30 } }),
        json!({ "type": "message_stop" }),
    ]);
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({ "stream": true, "system": "be brief" })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new(&config(&server)).unwrap();
    let request = ChatRequest::new(
        "claude-sonnet-4",
        vec![ChatMessage::system("be brief"), ChatMessage::user("weather?")],
    )
    .with_tools(vec![weather_tool()]);
    let chunks = collect(&provider, &request).await;

    let reasoning: String = chunks.iter().filter_map(|c| c.reasoning.clone()).collect();
    assert_eq!(reasoning, "hmm");
    let text: String = chunks.iter().filter_map(|c| c.content.clone()).collect();
    assert_eq!(text, "Checking.");
    let calls: Vec<_> = chunks.iter().filter_map(|c| c.tool_calls.clone()).flatten().collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "toolu_1");
    assert_eq!(calls[0].arguments, r#"{"city":"Oslo"}"#);

    let done: Vec<_> = chunks.iter().filter(|c| c.done).collect();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].finish_reason.as_deref(), Some("tool_use"));
}

#[tokio::test]
async fn anthropic_overloaded_status_is_a_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_json(json!({
            "type": "error",
            "error": { "type": "overloaded_error", "message": "Overloaded" }
        })))
        .mount(&server)
        .await;

    let provider = AnthropicProvider::new(&config(&server)).unwrap();
    let err = provider
        .chat(&ChatRequest::new("claude-sonnet-4", vec![ChatMessage::user("hi")]))
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Server { status: 529, .. }));
}

#[tokio::test]
async fn gemini_chat_and_stream_use_model_scoped_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.0-flash:generateContent"))
        .and(header("x-goog-api-key", "test-key"))
        .and(body_partial_json(json!({
            "systemInstruction": { "parts": [{ "text": "be brief" }] },
            "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "thinking", "thought": true }, { "text": "Hello" }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 4, "candidatesTokenCount": 2, "thoughtsTokenCount": 3, "totalTokenCount": 9 }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/gemini-2.0-flash:streamGenerateContent"))
        .and(query_param("alt", "sse"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse(&[
                json!({ "candidates": [{ "content": { "parts": [{ "text": "Hel" }] } }] }),
                json!({ "candidates": [{ "content": { "parts": [{ "functionCall": { "name": "get_weather", "args": { "city": "Oslo" } } }] }, "finishReason": "STOP" }],
                        "usageMetadata": { "promptTokenCount": 4, "candidatesTokenCount": 6, "totalTokenCount": 10 } }),
            ]),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let provider = GeminiProvider::new(&config(&server)).unwrap();
    let request = ChatRequest::new(
        "gemini-2.0-flash",
        vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
    );

    let response = provider.chat(&request).await.unwrap();
    assert_eq!(response.content, "Hello");
    assert_eq!(response.reasoning.as_deref(), Some("thinking"));
    assert_eq!(response.usage.output_tokens, 5);

    let chunks = collect(&provider, &request.clone().with_tools(vec![weather_tool()])).await;
    let calls: Vec<_> = chunks.iter().filter_map(|c| c.tool_calls.clone()).flatten().collect();
    assert_eq!(calls[0].name, "get_weather");
    assert!(!calls[0].id.is_empty());
    let done = chunks.last().unwrap();
    assert!(done.done);
    assert_eq!(done.usage.as_ref().unwrap().total_tokens, 10);
}

fn bedrock_config(server: &MockServer) -> ProviderConfig {
    ProviderConfig {
        access_key_id: Some("AKIDEXAMPLE".into()),
        secret_access_key: Some("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into()),
        region: Some("us-west-2".into()),
        base_url: Some(server.uri()),
        ..Default::default()
    }
}

/// Binary event-stream frame with zeroed checksums.
fn frame(event_type: &str, payload: serde_json::Value) -> Vec<u8> {
    let mut headers = Vec::new();
    for (name, value) in [(":event-type", event_type), (":message-type", "event")] {
        headers.push(name.len() as u8);
        headers.extend_from_slice(name.as_bytes());
        headers.push(7);
        headers.extend_from_slice(&(value.len() as u16).to_be_bytes());
        headers.extend_from_slice(value.as_bytes());
    }
    let payload = payload.to_string().into_bytes();
    let total = 12 + headers.len() + payload.len() + 4;

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&headers);
    out.extend_from_slice(&payload);
    out.extend_from_slice(&[0; 4]);
    out
}

#[tokio::test]
async fn bedrock_requests_are_signed_and_converse_response_maps() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/model/[^/]+/converse$"))
        .and(header_exists("authorization"))
        .and(header_exists("x-amz-date"))
        .and(header_exists("x-amz-content-sha256"))
        .and(body_partial_json(json!({ "system": [{ "text": "be brief" }] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output": { "message": { "role": "assistant", "content": [{ "text": "Hi there" }] } },
            "stopReason": "end_turn",
            "usage": { "inputTokens": 8, "outputTokens": 3, "totalTokens": 11 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = BedrockProvider::new(&bedrock_config(&server)).unwrap();
    let request = ChatRequest::new(
        "anthropic.claude-3-haiku-20240307-v1:0",
        vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
    );
    let response = provider.chat(&request).await.unwrap();
    assert_eq!(response.content, "Hi there");
    assert_eq!(response.usage.total_tokens, 11);

    let received = server.received_requests().await.unwrap();
    let auth = received[0].headers.get("authorization").unwrap().to_str().unwrap();
    assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    assert!(auth.contains("/us-west-2/bedrock/aws4_request"));
}

#[tokio::test]
async fn bedrock_stream_decodes_binary_frames() {
    let server = MockServer::start().await;
    let mut body = Vec::new();
    body.extend(frame("messageStart", json!({ "role": "assistant" })));
    body.extend(frame("contentBlockDelta", json!({ "contentBlockIndex": 0, "delta": { "text": "Hello " } })));
    body.extend(frame("contentBlockDelta", json!({ "contentBlockIndex": 0, "delta": { "text": "world" } })));
    body.extend(frame("contentBlockStop", json!({ "contentBlockIndex": 0 })));
    body.extend(frame("messageStop", json!({ "stopReason": "end_turn" })));
    body.extend(frame("metadata", json!({ "usage": { "inputTokens": 4, "outputTokens": 2, "totalTokens": 6 } })));
    Mock::given(method("POST"))
        .and(path_regex(r"^/model/[^/]+/converse-stream$"))
        .and(header("accept", "application/vnd.amazon.eventstream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/vnd.amazon.eventstream"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = BedrockProvider::new(&bedrock_config(&server)).unwrap();
    let request = ChatRequest::new("amazon.nova-lite-v1:0", vec![ChatMessage::user("hi")]);
    let chunks = collect(&provider, &request).await;

    let text: String = chunks.iter().filter_map(|c| c.content.clone()).collect();
    assert_eq!(text, "Hello world");
    assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    let done = chunks.last().unwrap();
    assert_eq!(done.finish_reason.as_deref(), Some("end_turn"));
    assert_eq!(done.usage.as_ref().unwrap().total_tokens, 6);
}

#[tokio::test]
async fn bedrock_requires_credentials() {
    let err = BedrockProvider::new(&ProviderConfig::default()).err().unwrap();
    assert!(matches!(err, LlmError::InvalidInput(_)));
}
