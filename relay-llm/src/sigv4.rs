//! AWS Signature Version 4 for single requests.
//!
//! Pure and deterministic: the timestamp is an input, so the same request
//! always produces the same `authorization` value.

use crate::error::{LlmError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// RFC 3986 unreserved characters stay literal; everything else is encoded.
const URI_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SigningParams<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub body: &'a [u8],
    pub region: &'a str,
    pub service: &'a str,
    pub timestamp: DateTime<Utc>,
    /// Sign and emit `x-amz-content-sha256`. Bedrock wants it; the published
    /// reference vectors do not include it.
    pub include_content_sha256: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub host: String,
    pub x_amz_date: String,
    pub x_amz_content_sha256: Option<String>,
    pub x_amz_security_token: Option<String>,
    pub authorization: String,
}

impl SignedHeaders {
    /// Header pairs to set on the outgoing request. `host` is left to the
    /// HTTP client, which derives the same value from the URL.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![("x-amz-date", self.x_amz_date.clone())];
        if let Some(hash) = &self.x_amz_content_sha256 {
            out.push(("x-amz-content-sha256", hash.clone()));
        }
        if let Some(token) = &self.x_amz_security_token {
            out.push(("x-amz-security-token", token.clone()));
        }
        out.push(("authorization", self.authorization.clone()));
        out
    }
}

pub fn sign(credentials: &Credentials, params: &SigningParams<'_>) -> Result<SignedHeaders> {
    let url = reqwest::Url::parse(params.url)
        .map_err(|e| LlmError::Signing(format!("invalid url {}: {e}", params.url)))?;
    let host = match (url.host_str(), url.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_string(),
        (None, _) => return Err(LlmError::Signing(format!("url has no host: {}", params.url))),
    };

    let amz_date = params.timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date = params.timestamp.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(params.body);
    let session_token = credentials
        .session_token
        .as_deref()
        .filter(|t| !t.is_empty());

    let mut headers: Vec<(&str, &str)> =
        vec![("host", host.as_str()), ("x-amz-date", amz_date.as_str())];
    if params.include_content_sha256 {
        headers.push(("x-amz-content-sha256", payload_hash.as_str()));
    }
    if let Some(token) = session_token {
        headers.push(("x-amz-security-token", token));
    }
    headers.sort_by(|a, b| a.0.cmp(b.0));

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{}\n", v.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(k, _)| *k)
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        params.method.to_ascii_uppercase(),
        canonical_uri(url.path()),
        canonical_query(&url),
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let scope = format!("{date}/{}/{}/aws4_request", params.region, params.service);
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(
        &credentials.secret_access_key,
        &date,
        params.region,
        params.service,
    )?;
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

    tracing::trace!(%scope, %signed_headers, "sigv4 request signed");

    Ok(SignedHeaders {
        host,
        x_amz_date: amz_date,
        x_amz_content_sha256: params.include_content_sha256.then_some(payload_hash),
        x_amz_security_token: session_token.map(str::to_string),
        authorization: format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        ),
    })
}

/// `kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")`
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| LlmError::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn uri_encode(s: &str) -> String {
    utf8_percent_encode(s, URI_ENCODE).to_string()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Each segment of the path as sent is encoded once more.
fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

fn canonical_query(url: &reqwest::Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}
