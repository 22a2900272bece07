use axum::http::{HeaderMap, HeaderValue};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hookrelay::envelope::{is_mutated, RequestEnvelope};
use hookrelay::headers::{passthrough_headers, sanitize_for_server_credential};
use serde_json::json;

fn client_headers() -> HeaderMap {
    let mut map = HeaderMap::new();
    let pairs = [
        ("host", "localhost:4000"),
        ("content-length", "2048"),
        ("x-api-key", "ck1"),
        ("anthropic-version", "2023-06-01"),
        ("user-agent", "claude-cli/1.0.0 (external, cli)"),
        ("x-app", "cli"),
        ("x-stainless-lang", "js"),
        ("x-stainless-os", "Linux"),
        ("x-stainless-runtime", "node"),
        ("x-stainless-retry-count", "0"),
        (
            "anthropic-beta",
            "claude-code-20250219, interleaved-thinking-2025-05-14, fine-grained-tool-streaming-2025-05-14",
        ),
        ("accept", "application/json"),
    ];
    for (k, v) in pairs {
        map.append(k, HeaderValue::from_static(v));
    }
    map
}

fn bench_headers(c: &mut Criterion) {
    let incoming = client_headers();
    c.bench_function("passthrough_headers", |b| {
        b.iter(|| passthrough_headers(black_box(&incoming)))
    });
    let forwarded = passthrough_headers(&incoming);
    c.bench_function("sanitize_for_server_credential", |b| {
        b.iter(|| sanitize_for_server_credential(black_box(&forwarded)))
    });
}

fn bench_mutation_check(c: &mut Criterion) {
    let tools: Vec<_> = (0..32)
        .map(|i| json!({"name": format!("tool_{i}"), "input_schema": {"type": "object"}}))
        .collect();
    let body = json!({
        "model": "m1",
        "system": "You are a careful assistant.",
        "messages": [{"role": "user", "content": "hi"}],
        "tools": tools,
    });
    let original: RequestEnvelope = serde_json::from_value(body).unwrap();
    let copy = original.clone();
    c.bench_function("is_mutated_clone", |b| {
        b.iter(|| is_mutated(black_box(&original), black_box(&copy)))
    });
    c.bench_function("outbound_body", |b| {
        b.iter(|| black_box(&original).outbound(false))
    });
}

criterion_group!(benches, bench_headers, bench_mutation_check);
criterion_main!(benches);
