#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::StreamExt;
use http_body_util::BodyExt;
use hookrelay::{app, build_state, AppConfig, ExtensionHandle};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// One request as received by a mock server.
#[derive(Clone, Debug)]
pub struct Captured {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Captured {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Clone)]
pub enum MockReply {
    Json(u16, Value),
    Text(u16, &'static str),
    Sse(Vec<&'static str>),
    /// Sends one frame, then keeps the response open without more data.
    SseThenHang(&'static str),
}

#[derive(Clone)]
struct MockState {
    reply: MockReply,
    captured: Arc<Mutex<Vec<Captured>>>,
}

pub struct MockUpstream {
    pub base: String,
    pub captured: Arc<Mutex<Vec<Captured>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockUpstream {
    pub fn requests(&self) -> Vec<Captured> {
        self.captured.lock().unwrap().clone()
    }

    pub fn only_request(&self) -> Captured {
        let requests = self.requests();
        assert_eq!(requests.len(), 1, "expected exactly one upstream request");
        requests.into_iter().next().unwrap()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn mock_handler(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.captured.lock().unwrap().push(Captured {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body,
    });
    match state.reply {
        MockReply::Json(status, value) => (
            StatusCode::from_u16(status).unwrap(),
            axum::Json(value),
        )
            .into_response(),
        MockReply::Text(status, text) => (
            StatusCode::from_u16(status).unwrap(),
            [(header::CONTENT_TYPE, "application/json")],
            text,
        )
            .into_response(),
        MockReply::Sse(frames) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/event-stream")],
            frames.concat(),
        )
            .into_response(),
        MockReply::SseThenHang(first) => {
            let frames = futures::stream::once(async move {
                Ok::<_, std::convert::Infallible>(Bytes::from_static(first.as_bytes()))
            })
            .chain(futures::stream::pending());
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(frames),
            )
                .into_response()
        }
    }
}

/// Mock Messages API answering every request with `reply`.
pub async fn spawn_upstream(reply: MockReply) -> MockUpstream {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let state = MockState {
        reply,
        captured: captured.clone(),
    };
    let router = Router::new().fallback(mock_handler).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    MockUpstream {
        base: format!("http://{}", addr),
        captured,
        handle,
    }
}

/// Router under test plus the file its observability records land in.
pub struct TestApp {
    pub router: Router,
    pub log_dir: TempDir,
}

impl TestApp {
    pub fn new(upstream_url: &str, fallback_key: Option<&str>, extension: ExtensionHandle) -> Self {
        let log_dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            fallback_api_key: fallback_key.map(str::to_string),
            upstream_url: upstream_url.to_string(),
            log_file: Some(log_dir.path().join("events.log").display().to_string()),
            log_stdout: false,
            ..AppConfig::default()
        };
        Self::with_config(&config, extension, log_dir)
    }

    pub fn with_config(config: &AppConfig, extension: ExtensionHandle, log_dir: TempDir) -> Self {
        let state = build_state(config, extension).unwrap();
        Self {
            router: app(state),
            log_dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    /// Response with its body not yet read.
    pub async fn open(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Observability records written so far.
    pub fn events(&self) -> Vec<Value> {
        let path = self.log_dir.path().join("events.log");
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

pub fn messages_request(api_key: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/v1/messages")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn message_response(text: &str) -> Value {
    serde_json::json!({
        "id": "msg_01",
        "type": "message",
        "role": "assistant",
        "model": "m1",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {"input_tokens": 10, "output_tokens": 4}
    })
}
