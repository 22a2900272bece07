//! Per-request observability: a local JSON record, in-process counters and a
//! best-effort trace export to Langfuse.

use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::LangfuseConfig;

/// Latency histogram bucket upper bounds, in milliseconds.
pub const LATENCY_BUCKETS_MS: [u64; 12] = [
    10, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000, 120_000,
];

const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);
const TRACE_NAME: &str = "hookrelay_request";

/// One record per request, or per terminal state of a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservabilityEvent {
    pub endpoint: String,
    pub model: String,
    pub latency: Duration,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub middleware_modified: bool,
    pub error: Option<String>,
    pub request_body: Option<Value>,
    pub response_body: Option<Value>,
}

#[derive(Serialize)]
struct LocalRecord<'a> {
    event: &'static str,
    ts: String,
    endpoint: &'a str,
    model: &'a str,
    latency_seconds: f64,
    middleware_modified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl ObservabilityEvent {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Latency in seconds rounded to four decimals.
    pub fn latency_seconds(&self) -> f64 {
        (self.latency.as_secs_f64() * 10_000.0).round() / 10_000.0
    }

    pub fn local_record(&self, now: DateTime<Utc>) -> Value {
        let record = LocalRecord {
            event: "proxy_request",
            ts: now.to_rfc3339(),
            endpoint: &self.endpoint,
            model: &self.model,
            latency_seconds: self.latency_seconds(),
            middleware_modified: self.middleware_modified,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            error: self.error.as_deref(),
        };
        serde_json::to_value(record).unwrap_or(Value::Null)
    }
}

/// Counters exposed on `/metrics`.
pub struct SinkMetrics {
    pub events_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub mutated_total: AtomicU64,
    pub export_failures_total: AtomicU64,
    pub lines_total: AtomicU64,
    pub write_errors_total: AtomicU64,
    pub hist_counts: Vec<AtomicU64>,
    pub hist_sum_ms: AtomicU64,
    pub hist_count: AtomicU64,
}

impl Default for SinkMetrics {
    fn default() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            mutated_total: AtomicU64::new(0),
            export_failures_total: AtomicU64::new(0),
            lines_total: AtomicU64::new(0),
            write_errors_total: AtomicU64::new(0),
            hist_counts: LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
        }
    }
}

impl SinkMetrics {
    fn observe(&self, event: &ObservabilityEvent) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        if event.error.is_some() {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        if event.middleware_modified {
            self.mutated_total.fetch_add(1, Ordering::Relaxed);
        }
        let ms = event.latency.as_millis() as u64;
        self.hist_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        // first bucket >= value; larger values only land in +Inf
        if let Some(idx) = LATENCY_BUCKETS_MS.iter().position(|ub| ms <= *ub) {
            self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Clone)]
pub struct TelemetrySink {
    writer: Option<Arc<Mutex<fs::File>>>,
    log_stdout: bool,
    exporter: Option<LangfuseExporter>,
    metrics: Arc<SinkMetrics>,
}

impl TelemetrySink {
    pub fn new(log_file: Option<&str>, log_stdout: bool, langfuse: Option<LangfuseConfig>) -> Self {
        let writer = log_file.and_then(|path| {
            match fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => Some(Arc::new(Mutex::new(f))),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to open LOG_FILE; file records disabled");
                    None
                }
            }
        });
        let exporter = langfuse.and_then(|cfg| match LangfuseExporter::new(cfg) {
            Ok(exporter) => Some(exporter),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build Langfuse client; trace export disabled");
                None
            }
        });
        Self {
            writer,
            log_stdout,
            exporter,
            metrics: Arc::new(SinkMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &SinkMetrics {
        &self.metrics
    }

    pub fn exports_traces(&self) -> bool {
        self.exporter.is_some()
    }

    /// Never blocks on, nor fails because of, delivery.
    pub fn record(&self, event: ObservabilityEvent) {
        self.metrics.observe(&event);
        let record = event.local_record(Utc::now());
        self.write_line(&record);
        if self.log_stdout {
            tracing::info!(
                target: "telemetry",
                event = "proxy_request",
                endpoint = %event.endpoint,
                model = %event.model,
                latency_seconds = event.latency_seconds(),
                middleware_modified = event.middleware_modified,
                input_tokens = ?event.input_tokens,
                output_tokens = ?event.output_tokens,
                error = ?event.error,
            );
        }
        if let Some(exporter) = &self.exporter {
            exporter.spawn_export(event, self.metrics.clone());
        }
    }

    fn write_line(&self, payload: &Value) {
        let Some(target) = &self.writer else {
            return;
        };
        let Ok(mut file) = target.lock() else {
            return;
        };
        match writeln!(file, "{}", payload) {
            Ok(()) => {
                self.metrics.lines_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to write telemetry line");
                self.metrics.write_errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Clone)]
pub struct LangfuseExporter {
    config: LangfuseConfig,
    client: reqwest::Client,
}

impl LangfuseExporter {
    pub fn new(config: LangfuseConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(EXPORT_TIMEOUT).build()?;
        Ok(Self { config, client })
    }

    pub fn ingestion_url(&self) -> String {
        format!("{}/api/public/ingestion", self.config.base_url)
    }

    /// Ingestion payload: a trace plus one generation spanning the request.
    pub fn batch(event: &ObservabilityEvent, now: DateTime<Utc>) -> Value {
        let ts = langfuse_timestamp(now);
        let started = now - chrono::Duration::milliseconds(event.latency.as_millis() as i64);
        let input = event
            .request_body
            .clone()
            .unwrap_or_else(|| json!({"endpoint": event.endpoint, "model": event.model}));
        let output = event.response_body.clone().unwrap_or_else(|| summary(event));

        let trace_id = uuid::Uuid::new_v4().to_string();
        let trace = json!({
            "type": "trace-create",
            "id": uuid::Uuid::new_v4().to_string(),
            "timestamp": ts,
            "body": {
                "id": trace_id,
                "timestamp": ts,
                "name": TRACE_NAME,
                "metadata": metadata(event),
                "input": input,
                "output": output,
            },
        });

        let mut generation = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "traceId": trace_id,
            "name": TRACE_NAME,
            "startTime": langfuse_timestamp(started),
            "endTime": ts,
            "model": event.model,
            "input": input,
            "output": output,
        });
        if event.input_tokens.is_some() || event.output_tokens.is_some() {
            generation["usage"] = json!({
                "promptTokens": event.input_tokens.unwrap_or(0),
                "completionTokens": event.output_tokens.unwrap_or(0),
            });
        }

        json!({
            "batch": [
                trace,
                {
                    "type": "generation-create",
                    "id": uuid::Uuid::new_v4().to_string(),
                    "timestamp": ts,
                    "body": generation,
                },
            ]
        })
    }

    fn spawn_export(&self, event: ObservabilityEvent, metrics: Arc<SinkMetrics>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no async runtime; skipping trace export");
            return;
        };
        let exporter = self.clone();
        runtime.spawn(async move {
            if let Err(e) = exporter.export(&event).await {
                metrics.export_failures_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Langfuse trace export failed");
            }
        });
    }

    pub async fn export(&self, event: &ObservabilityEvent) -> Result<(), reqwest::Error> {
        self.client
            .post(self.ingestion_url())
            .basic_auth(&self.config.public_key, Some(&self.config.secret_key))
            .json(&Self::batch(event, Utc::now()))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn langfuse_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn metadata(event: &ObservabilityEvent) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("endpoint".into(), event.endpoint.clone().into());
    out.insert("model".into(), event.model.clone().into());
    out.insert("latency_seconds".into(), event.latency_seconds().to_string().into());
    out.insert(
        "middleware_modified".into(),
        event.middleware_modified.to_string().into(),
    );
    if let Some(n) = event.input_tokens {
        out.insert("input_tokens".into(), n.to_string().into());
    }
    if let Some(n) = event.output_tokens {
        out.insert("output_tokens".into(), n.to_string().into());
    }
    if let Some(err) = &event.error {
        out.insert("error".into(), err.clone().into());
    }
    out
}

fn summary(event: &ObservabilityEvent) -> Value {
    let mut out = json!({
        "latency_seconds": event.latency_seconds(),
        "middleware_modified": event.middleware_modified,
    });
    if let Some(n) = event.input_tokens {
        out["input_tokens"] = n.into();
    }
    if let Some(n) = event.output_tokens {
        out["output_tokens"] = n.into();
    }
    if let Some(err) = &event.error {
        out["error"] = err.clone().into();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event() -> ObservabilityEvent {
        ObservabilityEvent {
            endpoint: "/v1/messages".into(),
            model: "m1".into(),
            latency: Duration::from_micros(1_234_567),
            input_tokens: Some(12),
            output_tokens: None,
            middleware_modified: true,
            error: None,
            request_body: None,
            response_body: None,
        }
    }

    #[test]
    fn local_record_rounds_latency_and_skips_absent_fields() {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let record = event().local_record(now);
        assert_eq!(record["event"], "proxy_request");
        assert_eq!(record["latency_seconds"], json!(1.2346));
        assert_eq!(record["input_tokens"], 12);
        assert!(record.get("output_tokens").is_none());
        assert!(record.get("error").is_none());
        assert_eq!(record["middleware_modified"], true);
    }

    #[test]
    fn batch_links_generation_to_trace() {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let batch = LangfuseExporter::batch(&event(), now);
        let events = batch["batch"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "trace-create");
        assert_eq!(events[1]["type"], "generation-create");
        assert_eq!(events[1]["body"]["traceId"], events[0]["body"]["id"]);
        assert_eq!(events[0]["timestamp"], "2025-01-02T03:04:05.000Z");
        assert_eq!(events[1]["body"]["startTime"], "2025-01-02T03:04:03.766Z");
        assert_eq!(events[0]["body"]["metadata"]["middleware_modified"], "true");
        assert_eq!(events[0]["body"]["input"], json!({"endpoint": "/v1/messages", "model": "m1"}));
        assert_eq!(events[1]["body"]["usage"]["completionTokens"], 0);
    }

    #[test]
    fn record_updates_counters_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let sink = TelemetrySink::new(path.to_str(), false, None);

        let mut failed = event();
        failed.error = Some("upstream returned 529".into());
        failed.latency = Duration::from_millis(200_000);
        sink.record(event());
        sink.record(failed);

        let metrics = sink.metrics();
        assert_eq!(metrics.events_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.errors_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.mutated_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.hist_count.load(Ordering::Relaxed), 2);
        let bucketed: u64 = metrics
            .hist_counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum();
        assert_eq!(bucketed, 1);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["error"], "upstream returned 529");
    }
}
