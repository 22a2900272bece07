//! Core library for hookrelay, a Messages API proxy with a pluggable
//! extension hook surface.  This module wires the pipeline, the upstream
//! client and the observability sink into an axum router.

pub mod config;
pub mod envelope;
pub mod error;
pub mod extensions;
pub mod headers;
pub mod pipeline;
pub mod telemetry;
pub mod upstream;

pub use config::{AppConfig, ConfigDescriptor};
pub use envelope::{MessageResponse, RequestEnvelope};
pub use error::ProxyError;
pub use extensions::{Extension, ExtensionHandle};
pub use pipeline::{CredentialContext, InboundRequest, ProxyPipeline, ProxyReply};

use std::sync::atomic::Ordering;
use std::time::Instant;

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::{rejection::BytesRejection, DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::extensions::resolve_extension;
use crate::telemetry::{TelemetrySink, LATENCY_BUCKETS_MS};
use crate::upstream::UpstreamClient;

/// Shared by every handler.  Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: ProxyPipeline,
    pub max_request_bytes: usize,
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

/// Build state from an already-parsed configuration and a resolved
/// extension.
pub fn build_state(config: &AppConfig, extension: ExtensionHandle) -> anyhow::Result<AppState> {
    let upstream = UpstreamClient::new(&config.upstream_url)
        .context("Failed to build upstream HTTP client")?;
    let telemetry = TelemetrySink::new(
        config.log_file.as_deref(),
        config.log_stdout,
        config.langfuse.clone(),
    );
    let pipeline = ProxyPipeline::new(
        extension,
        upstream,
        telemetry,
        config.fallback_api_key.clone(),
    );
    let start_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(AppState {
        pipeline,
        max_request_bytes: config.max_request_bytes,
        process_start_epoch: start_time.as_secs_f64(),
        process_start_instant: Instant::now(),
    })
}

/// Resolve the extension named by the config descriptor, if any.  A
/// descriptor that cannot be read leaves the proxy in passthrough mode.
pub fn load_extension(config: &AppConfig) -> ExtensionHandle {
    let path = config.config_path.as_deref()?;
    tracing::info!(path = %path.display(), "loading config descriptor");
    match ConfigDescriptor::load(path) {
        Ok(descriptor) => resolve_extension(&descriptor, &config.project_root()),
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "config descriptor unusable; no extension loaded");
            None
        }
    }
}

/// Build state from environment variables and the discovered config
/// descriptor.  See [`AppConfig::from_env`] for the variables read.
pub fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    build_state_logged(&config)
}

/// [`build_state`] plus the startup summary logs.
pub fn build_state_logged(config: &AppConfig) -> anyhow::Result<AppState> {
    let extension = load_extension(config);
    match &extension {
        Some(ext) => tracing::info!(extension = %ext.name(), "extension loaded"),
        None => tracing::info!("no extension configured; running as passthrough only"),
    }
    if config.fallback_api_key.is_none() {
        tracing::warn!("ANTHROPIC_API_KEY not set; requests without x-api-key will be rejected");
    }
    if config.langfuse.is_some() {
        tracing::info!("Langfuse trace export enabled");
    }
    tracing::info!(upstream = %config.upstream_url, "upstream configured");
    build_state(config, extension)
}

pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/messages", post(messages_handler))
        .route(
            "/v1/messages/*subpath",
            get(passthrough_handler)
                .post(passthrough_handler)
                .put(passthrough_handler)
                .delete(passthrough_handler),
        )
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(state)
}

fn body_error(state: &AppState, rejection: BytesRejection) -> ProxyError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        tracing::warn!(limit = state.max_request_bytes, "request body exceeded configured limit");
        return ProxyError::PayloadTooLarge(format!(
            "Request too large (body exceeded limit {} bytes)",
            state.max_request_bytes
        ));
    }
    ProxyError::InvalidRequest(rejection.body_text())
}

async fn messages_handler(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(b) => b,
        Err(rejection) => {
            let err = body_error(&state, rejection);
            return state.pipeline.reject(err).into_response();
        }
    };
    let inbound = InboundRequest {
        headers,
        query: uri.query().map(str::to_string),
        body,
    };
    match state.pipeline.handle(inbound).await {
        Ok(ProxyReply::Unary(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(ProxyReply::Stream(frames)) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(frames),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn passthrough_handler(
    State(state): State<AppState>,
    method: Method,
    Path(subpath): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(b) => b,
        Err(rejection) => return body_error(&state, rejection).into_response(),
    };
    let inbound = InboundRequest {
        headers,
        query: uri.query().map(str::to_string),
        body,
    };
    match state.pipeline.passthrough(method, &subpath, inbound).await {
        Ok(raw) => (
            raw.status,
            [(header::CONTENT_TYPE, raw.content_type_or_json())],
            raw.body,
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(subpath = %subpath, error = %err, "passthrough request failed");
            err.into_response()
        }
    }
}

/// Liveness probe.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    use std::fmt::Write as _;
    let mut buf = String::new();
    let metrics = state.pipeline.telemetry().metrics();

    let counters = [
        (
            "hookrelay_requests_total",
            "Proxied requests recorded (one per request or stream)",
            metrics.events_total.load(Ordering::Relaxed),
        ),
        (
            "hookrelay_request_errors_total",
            "Recorded requests that ended with an error",
            metrics.errors_total.load(Ordering::Relaxed),
        ),
        (
            "hookrelay_mutated_requests_total",
            "Requests whose tools or system prompt were changed by the extension",
            metrics.mutated_total.load(Ordering::Relaxed),
        ),
        (
            "hookrelay_trace_export_failures_total",
            "Failed Langfuse trace exports",
            metrics.export_failures_total.load(Ordering::Relaxed),
        ),
        (
            "hookrelay_telemetry_lines_total",
            "JSON event lines written to LOG_FILE",
            metrics.lines_total.load(Ordering::Relaxed),
        ),
        (
            "hookrelay_telemetry_write_errors_total",
            "JSON event line write failures",
            metrics.write_errors_total.load(Ordering::Relaxed),
        ),
    ];
    for (name, help, value) in counters {
        writeln!(&mut buf, "# HELP {} {}", name, help).ok();
        writeln!(&mut buf, "# TYPE {} counter", name).ok();
        writeln!(&mut buf, "{} {}", name, value).ok();
    }

    writeln!(
        &mut buf,
        "# HELP hookrelay_request_latency_ms Request latency histogram milliseconds"
    )
    .ok();
    writeln!(&mut buf, "# TYPE hookrelay_request_latency_ms histogram").ok();
    let mut cumulative: u64 = 0;
    for (i, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
        cumulative += metrics.hist_counts[i].load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "hookrelay_request_latency_ms_bucket{{le=\"{}\"}} {}",
            ub, cumulative
        )
        .ok();
    }
    let count = metrics.hist_count.load(Ordering::Relaxed);
    writeln!(
        &mut buf,
        "hookrelay_request_latency_ms_bucket{{le=\"+Inf\"}} {}",
        count
    )
    .ok();
    writeln!(
        &mut buf,
        "hookrelay_request_latency_ms_sum {}",
        metrics.hist_sum_ms.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(&mut buf, "hookrelay_request_latency_ms_count {}", count).ok();

    let extension = state
        .pipeline
        .extension()
        .map(|e| e.name().to_string())
        .unwrap_or_default();
    writeln!(
        &mut buf,
        "# HELP hookrelay_build_info Build information\n# TYPE hookrelay_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "hookrelay_build_info{{version=\"{}\",extension=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION"),
        extension
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP hookrelay_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE hookrelay_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "hookrelay_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP hookrelay_process_uptime_seconds Process uptime seconds\n# TYPE hookrelay_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "hookrelay_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
