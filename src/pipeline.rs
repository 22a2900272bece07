//! Per-request proxy protocol for `POST /v1/messages`.
//!
//! Order within one request: credential extraction, body parse, pre-call
//! hook, credential routing, dispatch, follow-up loop (unary only), logging
//! hook, observability record.  Hook failures are logged and never reach
//! the caller.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use crate::envelope::{is_mutated, RequestEnvelope, Usage, CORRELATION_FIELD};
use crate::error::ProxyError;
use crate::extensions::{
    Extension, ExtensionHandle, FollowupRequest, LogContext, LoopRequest, PreCallContext,
    PROVIDER_TAG,
};
use crate::headers;
use crate::telemetry::{ObservabilityEvent, TelemetrySink};
use crate::upstream::{self, FollowupClient, RawResponse, UpstreamClient, MESSAGES_PATH};

const CALL_TYPE: &str = "anthropic_messages";
const CLIENT_DISCONNECTED: &str = "client disconnected";

/// Credentials and headers for one outbound call.  Built once per request;
/// routing happens at most once, before dispatch.
#[derive(Debug, Clone)]
pub struct CredentialContext {
    pub client_key: String,
    pub outbound_key: String,
    pub api_version: String,
    pub headers: HeaderMap,
}

impl CredentialContext {
    pub fn extract(incoming: &HeaderMap, fallback_key: Option<&str>) -> Result<Self, ProxyError> {
        let client_key = headers::client_api_key(incoming)
            .or_else(|| fallback_key.map(str::to_string))
            .ok_or_else(|| {
                ProxyError::Authentication(
                    "No API key provided. Send x-api-key or set ANTHROPIC_API_KEY.".into(),
                )
            })?;
        Ok(Self {
            outbound_key: client_key.clone(),
            client_key,
            api_version: headers::api_version(incoming),
            headers: headers::passthrough_headers(incoming),
        })
    }

    /// A mutated request goes out under the server credential with scrubbed
    /// headers, when one is configured.
    pub fn route(self, mutated: bool, fallback_key: Option<&str>) -> Self {
        match (mutated, fallback_key) {
            (true, Some(key)) => {
                let headers = headers::sanitize_for_server_credential(&self.headers);
                Self {
                    outbound_key: key.to_string(),
                    headers,
                    ..self
                }
            }
            (true, None) => {
                tracing::warn!(
                    "extension modified the request but ANTHROPIC_API_KEY is not set; forwarding with the client key"
                );
                self
            }
            (false, _) => self,
        }
    }
}

/// Inbound request as seen by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub headers: HeaderMap,
    pub query: Option<String>,
    pub body: Bytes,
}

pub type FrameBody = BoxStream<'static, Result<Bytes, Infallible>>;

pub enum ProxyReply {
    Unary(Value),
    Stream(FrameBody),
}

/// Observability event plus the instant latency is measured from.
struct PendingRecord {
    event: ObservabilityEvent,
    started: Instant,
    /// Outcome and latency are final; only emission is left.
    settled: bool,
}

impl PendingRecord {
    fn new() -> Self {
        Self {
            event: ObservabilityEvent::new(MESSAGES_PATH),
            started: Instant::now(),
            settled: false,
        }
    }

    fn settle(&mut self, error: Option<String>) {
        self.event.error = error;
        self.event.latency = self.started.elapsed();
        self.settled = true;
    }
}

#[derive(Clone)]
pub struct ProxyPipeline {
    extension: ExtensionHandle,
    upstream: UpstreamClient,
    telemetry: TelemetrySink,
    fallback_key: Option<String>,
}

impl ProxyPipeline {
    pub fn new(
        extension: ExtensionHandle,
        upstream: UpstreamClient,
        telemetry: TelemetrySink,
        fallback_key: Option<String>,
    ) -> Self {
        Self {
            extension,
            upstream,
            telemetry,
            fallback_key,
        }
    }

    pub fn extension(&self) -> Option<&Arc<dyn Extension>> {
        self.extension.as_ref()
    }

    pub fn telemetry(&self) -> &TelemetrySink {
        &self.telemetry
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    pub async fn handle(&self, inbound: InboundRequest) -> Result<ProxyReply, ProxyError> {
        let mut record = PendingRecord::new();
        let start_time = Utc::now();

        let creds = match CredentialContext::extract(&inbound.headers, self.fallback_key.as_deref()) {
            Ok(c) => c,
            Err(err) => return Err(self.fail_early(record, err)),
        };
        let original = match RequestEnvelope::parse(&inbound.body) {
            Ok(env) => env,
            Err(e) => {
                let err = ProxyError::InvalidRequest(format!("Invalid JSON body: {}", e));
                return Err(self.fail_early(record, err));
            }
        };
        let stream = original.is_stream();

        let (working, mutated) = match &self.extension {
            Some(ext) => self.run_pre_call(ext.as_ref(), original, stream).await,
            None => (original, false),
        };
        let creds = creds.route(mutated, self.fallback_key.as_deref());
        tracing::debug!(
            model = %working.model(),
            stream,
            mutated,
            server_credential = creds.outbound_key != creds.client_key,
            "dispatching request"
        );

        record.event.model = working.model().to_string();
        record.event.middleware_modified = mutated;
        if self.telemetry.exports_traces() {
            record.event.request_body = Some(Value::Object(working.without(&[CORRELATION_FIELD])));
        }

        if stream {
            Ok(self.dispatch_stream(working, creds, inbound.query, record, start_time))
        } else {
            self.dispatch_unary(working, creds, inbound.query, record, start_time)
                .await
                .map(ProxyReply::Unary)
        }
    }

    /// Record a request rejected before it reached the pipeline proper.
    pub fn reject(&self, err: ProxyError) -> ProxyError {
        self.fail_early(PendingRecord::new(), err)
    }

    /// Subpath passthrough: no hooks, no mutation, no observability record.
    pub async fn passthrough(
        &self,
        method: Method,
        subpath: &str,
        inbound: InboundRequest,
    ) -> Result<RawResponse, ProxyError> {
        let creds = CredentialContext::extract(&inbound.headers, self.fallback_key.as_deref())?;
        self.upstream
            .passthrough(method, subpath, inbound.query.as_deref(), &creds, inbound.body)
            .await
    }

    async fn dispatch_unary(
        &self,
        working: RequestEnvelope,
        creds: CredentialContext,
        query: Option<String>,
        mut record: PendingRecord,
        start_time: DateTime<Utc>,
    ) -> Result<Value, ProxyError> {
        let outbound = working.outbound(false);
        let result = self
            .upstream
            .send_message(&outbound, &creds, query.as_deref())
            .await;
        match result {
            Ok(response) => {
                let response = match &self.extension {
                    Some(ext) => {
                        let client = FollowupClient::new(self.upstream.clone(), creds);
                        self.run_followup_loop(ext.as_ref(), &working, response, &client)
                            .await
                    }
                    None => response,
                };
                let ctx = log_context(&working, false, start_time);
                self.log_success(&ctx, Some(&response)).await;

                let usage = Usage::from_response(&response);
                record.event.input_tokens = usage.input_tokens;
                record.event.output_tokens = usage.output_tokens;
                if self.telemetry.exports_traces() {
                    record.event.response_body = Some(response.clone());
                }
                self.emit(record);
                Ok(response)
            }
            Err(err) => {
                let ctx = log_context(&working, false, start_time);
                let message = err.to_string();
                self.log_failure(&ctx, &message).await;
                record.event.error = Some(message);
                self.emit(record);
                Err(err)
            }
        }
    }

    fn dispatch_stream(
        &self,
        working: RequestEnvelope,
        creds: CredentialContext,
        query: Option<String>,
        record: PendingRecord,
        start_time: DateTime<Utc>,
    ) -> ProxyReply {
        let outbound = working.outbound(true);
        let upstream = self.upstream.clone();
        let mut completion = StreamCompletion {
            pipeline: self.clone(),
            record: Some(record),
            correlation_id: working.correlation_id(),
            model: working.model().to_string(),
            start_time,
        };

        let frames = async_stream::stream! {
            let failure = match upstream.stream_message(&outbound, &creds, query.as_deref()).await {
                Err(err) => {
                    let message = err.to_string();
                    yield frame(upstream::server_error_frame(&message));
                    Some(message)
                }
                Ok(mut opened) => {
                    let mut failure = opened.rejected.take().map(|e| e.to_string());
                    while let Some(item) = opened.frames.next().await {
                        match item {
                            Ok(chunk) => yield frame(chunk),
                            Err(err) => {
                                let message = err.to_string();
                                yield frame(upstream::server_error_frame(&message));
                                failure = Some(message);
                                break;
                            }
                        }
                    }
                    failure
                }
            };
            completion.finish(failure).await;
        };
        ProxyReply::Stream(Box::pin(frames))
    }

    async fn run_pre_call(
        &self,
        ext: &dyn Extension,
        original: RequestEnvelope,
        stream: bool,
    ) -> (RequestEnvelope, bool) {
        let ctx = PreCallContext {
            call_type: CALL_TYPE,
            endpoint: MESSAGES_PATH,
            stream,
        };
        match ext.pre_call(&ctx, original.clone()).await {
            Ok(Some(returned)) => {
                let mutated = is_mutated(&original, &returned);
                (returned, mutated)
            }
            Ok(None) => (original, false),
            Err(e) => {
                tracing::warn!(hook = "pre_call", extension = %ext.name(), error = %e, "extension hook failed; request left unchanged");
                (original, false)
            }
        }
    }

    /// Ask the extension for a follow-up loop and adopt its response, if any.
    /// Any failure keeps the upstream response.
    async fn run_followup_loop(
        &self,
        ext: &dyn Extension,
        working: &RequestEnvelope,
        response: Value,
        client: &FollowupClient,
    ) -> Value {
        let request = LoopRequest {
            response: &response,
            model: working.model(),
            messages: working.messages(),
            tools: working.tools().map(Vec::as_slice),
            stream: false,
            provider: PROVIDER_TAG,
        };
        let decision = match ext.should_run_followup_loop(&request).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(hook = "should_run_followup_loop", extension = %ext.name(), error = %e, "extension hook failed");
                return response;
            }
        };
        if !decision.run {
            return response;
        }

        let extra_params = working.without(&["model", "messages", CORRELATION_FIELD]);
        let followup = FollowupRequest {
            model: working.model(),
            messages: working.messages(),
            response: &response,
            extra_params: &extra_params,
            stream: false,
            client,
        };
        let outcome = ext.run_followup_loop(decision.context, &followup).await;
        match outcome {
            Ok(Some(adopted)) => {
                tracing::debug!(extension = %ext.name(), "adopting follow-up loop response");
                adopted.into_value()
            }
            Ok(None) => response,
            Err(e) => {
                tracing::warn!(hook = "run_followup_loop", extension = %ext.name(), error = %e, "extension hook failed; keeping upstream response");
                response
            }
        }
    }

    async fn log_success(&self, ctx: &LogContext, response: Option<&Value>) {
        if let Some(ext) = &self.extension {
            if let Err(e) = ext.log_success(ctx, response).await {
                tracing::warn!(hook = "log_success", extension = %ext.name(), error = %e, "extension hook failed");
            }
        }
    }

    async fn log_failure(&self, ctx: &LogContext, error: &str) {
        if let Some(ext) = &self.extension {
            if let Err(e) = ext.log_failure(ctx, error).await {
                tracing::warn!(hook = "log_failure", extension = %ext.name(), error = %e, "extension hook failed");
            }
        }
    }

    fn fail_early(&self, mut record: PendingRecord, err: ProxyError) -> ProxyError {
        record.event.error = Some(err.to_string());
        self.emit(record);
        err
    }

    fn emit(&self, record: PendingRecord) {
        let mut event = record.event;
        if !record.settled {
            event.latency = record.started.elapsed();
        }
        self.telemetry.record(event);
    }
}

fn frame(chunk: Bytes) -> Result<Bytes, Infallible> {
    Ok(chunk)
}

fn log_context(working: &RequestEnvelope, stream: bool, start_time: DateTime<Utc>) -> LogContext {
    LogContext {
        correlation_id: working.correlation_id(),
        model: working.model().to_string(),
        stream,
        start_time,
        end_time: Utc::now(),
    }
}

/// Terminal bookkeeping of a relayed stream.  Dropping it before `finish`
/// means the caller went away; the record is still emitted, once.  Once
/// `finish` has started, the outcome is fixed and a later drop (the caller
/// leaving while a logging hook runs) only emits it.
struct StreamCompletion {
    pipeline: ProxyPipeline,
    record: Option<PendingRecord>,
    correlation_id: Option<String>,
    model: String,
    start_time: DateTime<Utc>,
}

impl StreamCompletion {
    async fn finish(&mut self, failure: Option<String>) {
        if let Some(record) = self.record.as_mut() {
            record.settle(failure.clone());
        }
        let ctx = LogContext {
            correlation_id: self.correlation_id.clone(),
            model: self.model.clone(),
            stream: true,
            start_time: self.start_time,
            end_time: Utc::now(),
        };
        match &failure {
            Some(message) => self.pipeline.log_failure(&ctx, message).await,
            None => self.pipeline.log_success(&ctx, None).await,
        }
        if let Some(record) = self.record.take() {
            self.pipeline.emit(record);
        }
    }
}

impl Drop for StreamCompletion {
    fn drop(&mut self) {
        if let Some(mut record) = self.record.take() {
            if !record.settled {
                tracing::debug!(model = %self.model, "stream dropped before completion");
                record.settle(Some(CLIENT_DISCONNECTED.to_string()));
            }
            self.pipeline.emit(record);
        }
    }
}
