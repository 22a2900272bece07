//! Outbound calls to the Messages API over one shared connection pool.

use std::pin::Pin;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use serde_json::{Map, Value};

use crate::error::{error_body, ProxyError};
use crate::headers::{API_KEY_HEADER, VERSION_HEADER};
use crate::pipeline::CredentialContext;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const TOTAL_TIMEOUT: Duration = Duration::from_secs(300);
pub const MESSAGES_PATH: &str = "/v1/messages";

/// Sampling and prompt parameters a follow-up call carries over.
const FOLLOWUP_PARAMS: [&str; 7] = [
    "max_tokens",
    "temperature",
    "top_p",
    "top_k",
    "system",
    "stop_sequences",
    "metadata",
];
const FOLLOWUP_DEFAULT_MAX_TOKENS: u64 = 16_384;

/// Raw upstream frames, relayed as they arrive.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>;

/// A streamed call whose response head has been received.
pub struct UpstreamStream {
    /// Set when the upstream answered non-2xx; `frames` then holds exactly
    /// one synthetic error frame.
    pub rejected: Option<ProxyError>,
    pub frames: FrameStream,
}

/// Result of a raw subpath passthrough.
#[derive(Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl RawResponse {
    /// Upstream content type, `application/json` when it sent none.
    pub fn content_type_or_json(&self) -> HeaderValue {
        self.content_type
            .clone()
            .unwrap_or_else(|| HeaderValue::from_static("application/json"))
    }
}

#[derive(Clone, Debug)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str, query: Option<&str>) -> String {
        match query.filter(|q| !q.is_empty()) {
            Some(q) => format!("{}{}?{}", self.base_url, path, q),
            None => format!("{}{}", self.base_url, path),
        }
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        creds: &CredentialContext,
    ) -> reqwest::RequestBuilder {
        let mut headers = creds.headers.clone();
        if let Ok(key) = HeaderValue::from_str(&creds.outbound_key) {
            headers.insert(API_KEY_HEADER, key);
        }
        if let Ok(version) = HeaderValue::from_str(&creds.api_version) {
            headers.insert(VERSION_HEADER, version);
        }
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.client
            .request(method, self.url(path, query))
            .headers(headers)
    }

    /// Unary call.  Non-2xx answers become [`ProxyError::Upstream`] carrying
    /// the raw body.
    pub async fn send_message(
        &self,
        body: &Value,
        creds: &CredentialContext,
        query: Option<&str>,
    ) -> Result<Value, ProxyError> {
        let resp = self
            .request(Method::POST, MESSAGES_PATH, query, creds)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(ProxyError::Upstream { status, body: text });
        }
        serde_json::from_str(&text)
            .map_err(|e| ProxyError::Transport(format!("upstream returned invalid JSON: {}", e)))
    }

    /// Streamed call.  Fails only if no response head arrives at all.
    pub async fn stream_message(
        &self,
        body: &Value,
        creds: &CredentialContext,
        query: Option<&str>,
    ) -> Result<UpstreamStream, ProxyError> {
        let resp = self
            .request(Method::POST, MESSAGES_PATH, query, creds)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let raw = resp.text().await.unwrap_or_default();
            let frame = raw_error_frame(&raw);
            return Ok(UpstreamStream {
                rejected: Some(ProxyError::Upstream { status, body: raw }),
                frames: Box::pin(stream::once(async move { Ok(frame) })),
            });
        }
        let frames = resp.bytes_stream().map(|chunk| chunk.map_err(transport));
        Ok(UpstreamStream {
            rejected: None,
            frames: Box::pin(frames),
        })
    }

    /// Forward any request under `/v1/messages/` without interpretation.
    pub async fn passthrough(
        &self,
        method: Method,
        subpath: &str,
        query: Option<&str>,
        creds: &CredentialContext,
        body: Bytes,
    ) -> Result<RawResponse, ProxyError> {
        let path = format!("{}/{}", MESSAGES_PATH, subpath.trim_start_matches('/'));
        let mut rb = self.request(method, &path, query, creds);
        if !body.is_empty() {
            rb = rb.body(body);
        }
        let resp = rb.send().await.map_err(transport)?;
        let status = resp.status();
        let content_type = resp.headers().get(header::CONTENT_TYPE).cloned();
        let body = resp.bytes().await.map_err(transport)?;
        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Upstream access handed to a follow-up loop.  Calls go out under the
/// credential and headers the request was routed with.
#[derive(Clone, Debug)]
pub struct FollowupClient {
    upstream: UpstreamClient,
    creds: CredentialContext,
}

impl FollowupClient {
    pub fn new(upstream: UpstreamClient, creds: CredentialContext) -> Self {
        Self { upstream, creds }
    }

    pub fn credentials(&self) -> &CredentialContext {
        &self.creds
    }

    /// Unary Messages call.  Only [`FOLLOWUP_PARAMS`] are taken from
    /// `params`; `max_tokens` defaults to 16384.
    pub async fn create_message(
        &self,
        model: &str,
        messages: &[Value],
        tools: Option<&[Value]>,
        params: &Map<String, Value>,
    ) -> Result<Value, ProxyError> {
        let body = followup_body(model, messages, tools, params);
        self.upstream.send_message(&body, &self.creds, None).await
    }
}

fn followup_body(
    model: &str,
    messages: &[Value],
    tools: Option<&[Value]>,
    params: &Map<String, Value>,
) -> Value {
    let mut body = Map::new();
    body.insert("model".into(), Value::String(model.to_string()));
    body.insert("messages".into(), Value::Array(messages.to_vec()));
    if let Some(tools) = tools.filter(|t| !t.is_empty()) {
        body.insert("tools".into(), Value::Array(tools.to_vec()));
    }
    for key in FOLLOWUP_PARAMS {
        if let Some(value) = params.get(key) {
            body.insert(key.to_string(), value.clone());
        }
    }
    body.entry("max_tokens")
        .or_insert_with(|| Value::from(FOLLOWUP_DEFAULT_MAX_TOKENS));
    body.insert("stream".into(), Value::Bool(false));
    Value::Object(body)
}

fn transport(err: reqwest::Error) -> ProxyError {
    ProxyError::Transport(err.to_string())
}

/// `event: error` frame carrying the upstream body untouched.
pub fn raw_error_frame(body: &str) -> Bytes {
    Bytes::from(format!("event: error\ndata: {}\n\n", body))
}

/// `event: error` frame with a `server_error` payload.
pub fn server_error_frame(message: &str) -> Bytes {
    raw_error_frame(&error_body("server_error", message).to_string())
}
