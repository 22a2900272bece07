//! Extension hook surface.
//!
//! An extension is resolved once at startup and shared read-only by every
//! request.  The pipeline only talks to the [`Extension`] trait; how an
//! extension was loaded (compiled-in registry entry, remote HTTP hook
//! service) is decided in [`resolver`].
//!
//! Every hook has a permissive default, so an extension that implements
//! nothing behaves exactly like no extension at all.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::{MessageResponse, RequestEnvelope};
use crate::error::ExtensionError;
use crate::upstream::FollowupClient;

pub mod http;
pub mod inject;
pub mod resolver;

pub use resolver::{resolve_extension, ExtensionDefinition};

/// Provider tag handed to the follow-up loop hooks.
pub const PROVIDER_TAG: &str = "anthropic";

/// Process-wide extension reference.  `None` is a valid permanent state.
pub type ExtensionHandle = Option<Arc<dyn Extension>>;

#[derive(Debug, Clone, Serialize)]
pub struct PreCallContext {
    pub call_type: &'static str,
    pub endpoint: &'static str,
    pub stream: bool,
}

/// Passed to the success/failure logging hooks.
#[derive(Debug, Clone, Serialize)]
pub struct LogContext {
    pub correlation_id: Option<String>,
    pub model: String,
    pub stream: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopRequest<'a> {
    pub response: &'a Value,
    pub model: &'a str,
    pub messages: &'a [Value],
    pub tools: Option<&'a [Value]>,
    pub stream: bool,
    pub provider: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopDecision {
    #[serde(default)]
    pub run: bool,
    #[serde(default)]
    pub context: Value,
}

impl LoopDecision {
    pub fn skip() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FollowupRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Value],
    pub response: &'a Value,
    pub extra_params: &'a Map<String, Value>,
    pub stream: bool,
    /// Further upstream calls made by the loop, routed like the request.
    /// Not part of the remote hook payload.
    #[serde(skip)]
    pub client: &'a FollowupClient,
}

/// What a follow-up loop may hand back in place of the upstream response.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopResponse {
    /// Already in wire shape.
    Raw(Value),
    /// Typed message, dumped to its canonical JSON form on adoption.
    Message(MessageResponse),
}

impl LoopResponse {
    pub fn into_value(self) -> Value {
        match self {
            LoopResponse::Raw(value) => value,
            LoopResponse::Message(message) => message.to_value(),
        }
    }
}

#[async_trait::async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect or rewrite the request before dispatch.  `Ok(None)` keeps the
    /// request as it was.
    async fn pre_call(
        &self,
        _ctx: &PreCallContext,
        _data: RequestEnvelope,
    ) -> Result<Option<RequestEnvelope>, ExtensionError> {
        Ok(None)
    }

    async fn log_success(
        &self,
        _ctx: &LogContext,
        _response: Option<&Value>,
    ) -> Result<(), ExtensionError> {
        Ok(())
    }

    async fn log_failure(&self, _ctx: &LogContext, _error: &str) -> Result<(), ExtensionError> {
        Ok(())
    }

    async fn should_run_followup_loop(
        &self,
        _req: &LoopRequest<'_>,
    ) -> Result<LoopDecision, ExtensionError> {
        Ok(LoopDecision::skip())
    }

    async fn run_followup_loop(
        &self,
        _loop_context: Value,
        _req: &FollowupRequest<'_>,
    ) -> Result<Option<LoopResponse>, ExtensionError> {
        Ok(None)
    }
}

/// Extension that accepts every default.
#[derive(Debug, Default, Clone)]
pub struct NoopExtension;

#[async_trait::async_trait]
impl Extension for NoopExtension {
    fn name(&self) -> &str {
        "noop"
    }
}
