//! Inbound header handling: which headers travel upstream, and how they are
//! scrubbed once the proxy authenticates with its own credential.

use axum::http::{header, HeaderMap, HeaderValue};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const VERSION_HEADER: &str = "anthropic-version";
pub const DEFAULT_API_VERSION: &str = "2023-06-01";

/// User agent sent upstream in place of the client's when headers are
/// sanitized.
pub const PROXY_USER_AGENT: &str = concat!("hookrelay/", env!("CARGO_PKG_VERSION"));

/// Never forwarded: hop-by-hop, recomputed by the client, or replaced by the
/// proxy.
const SKIPPED_HEADERS: [&str; 8] = [
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "accept-encoding",
    API_KEY_HEADER,
    VERSION_HEADER,
    "content-type",
];

const CLIENT_IDENTITY_HEADERS: [&str; 2] = ["x-app", "anthropic-dangerous-direct-browser-access"];
const SDK_HEADER_PREFIX: &str = "x-stainless-";
const BETA_HEADER: &str = "anthropic-beta";
const CLIENT_BETA_PREFIX: &str = "claude-code-";

/// Every inbound header except the fixed exclusion set.
pub fn passthrough_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in incoming.iter() {
        if SKIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Client credential from `x-api-key`, if present and non-empty.
pub fn client_api_key(incoming: &HeaderMap) -> Option<String> {
    incoming
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn api_version(incoming: &HeaderMap) -> String {
    incoming
        .get(VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(DEFAULT_API_VERSION)
        .to_string()
}

/// Strip client-identifying metadata before a request goes upstream under
/// the server's credential.
pub fn sanitize_for_server_credential(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str();
        if CLIENT_IDENTITY_HEADERS.contains(&lower) || lower.starts_with(SDK_HEADER_PREFIX) {
            continue;
        }
        if lower == BETA_HEADER {
            if let Some(kept) = filter_beta_tokens(value) {
                out.append(name.clone(), kept);
            }
            continue;
        }
        if name == header::USER_AGENT {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    if headers.contains_key(header::USER_AGENT) {
        out.insert(header::USER_AGENT, HeaderValue::from_static(PROXY_USER_AGENT));
    }
    out
}

fn filter_beta_tokens(value: &HeaderValue) -> Option<HeaderValue> {
    let raw = value.to_str().ok()?;
    let kept: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty() && !t.starts_with(CLIENT_BETA_PREFIX))
        .collect();
    if kept.is_empty() {
        return None;
    }
    HeaderValue::from_str(&kept.join(", ")).ok()
}
