//! Request plumbing shared by the HTTP backends.

use crate::error::{LlmError, Result};
use crate::provider::ChatRequest;
use crate::types::BinarySource;
use std::time::Duration;

/// Apply per-request headers, timeout and cancellation, then classify the status.
pub(crate) async fn send(
    provider: &str,
    builder: reqwest::RequestBuilder,
    request: &ChatRequest,
) -> Result<reqwest::Response> {
    let mut builder = builder;
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
    }

    let response = tokio::select! {
        _ = request.cancel.cancelled() => return Err(LlmError::Cancelled),
        response = builder.send() => response?,
    };

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = tokio::select! {
        _ = request.cancel.cancelled() => return Err(LlmError::Cancelled),
        body = response.text() => body.unwrap_or_default(),
    };
    tracing::warn!(
        provider,
        status = status.as_u16(),
        body_len = body.len(),
        "provider returned error status"
    );
    Err(LlmError::from_status(provider, status.as_u16(), &body).with_retry_after(retry_after))
}

/// Read a whole JSON body, aborting on cancellation.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    request: &ChatRequest,
) -> Result<T> {
    let body = tokio::select! {
        _ = request.cancel.cancelled() => return Err(LlmError::Cancelled),
        body = response.text() => body?,
    };
    Ok(serde_json::from_str(&body)?)
}

pub(crate) fn data_url(mime_type: &str, source: &BinarySource) -> String {
    match source {
        BinarySource::Base64(data) => format!("data:{mime_type};base64,{data}"),
        BinarySource::Url(url) => url.clone(),
    }
}
