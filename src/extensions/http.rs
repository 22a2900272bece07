//! Out-of-process extension: each enabled hook is a JSON POST to
//! `{url}/{hook}`.  Hooks that are not enabled fall back to the permissive
//! defaults of [`Extension`].
//!
//! A `pre_call` reply of `{"data": {...}}` replaces the request.  Leaving
//! `system` out of `data` keeps the original system prompt as is (no
//! mutation); sending `"system": null` removes it; any other value is a new
//! prompt and counts as a mutation, even when equal to the old one.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{
    Extension, FollowupRequest, LogContext, LoopDecision, LoopRequest, LoopResponse,
    PreCallContext,
};
use crate::envelope::RequestEnvelope;
use crate::error::ExtensionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    PreCall,
    LogSuccess,
    LogFailure,
    ShouldRunFollowupLoop,
    RunFollowupLoop,
}

impl HookKind {
    pub const ALL: [HookKind; 5] = [
        HookKind::PreCall,
        HookKind::LogSuccess,
        HookKind::LogFailure,
        HookKind::ShouldRunFollowupLoop,
        HookKind::RunFollowupLoop,
    ];

    pub fn path(self) -> &'static str {
        match self {
            HookKind::PreCall => "pre_call",
            HookKind::LogSuccess => "log_success",
            HookKind::LogFailure => "log_failure",
            HookKind::ShouldRunFollowupLoop => "should_run_followup_loop",
            HookKind::RunFollowupLoop => "run_followup_loop",
        }
    }
}

/// Module-file definition of a remote hook service.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct HttpExtensionDefinition {
    pub url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_hooks")]
    pub hooks: Vec<HookKind>,
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_hooks() -> Vec<HookKind> {
    HookKind::ALL.to_vec()
}

impl HttpExtensionDefinition {
    pub fn exposes(&self, hook: HookKind) -> bool {
        self.hooks.contains(&hook)
    }
}

#[derive(Default, Deserialize)]
struct PreCallReply {
    #[serde(default)]
    data: Option<Map<String, Value>>,
}

const SYSTEM_FIELD: &str = "system";

/// Rebuild the envelope from a remote reply, keeping the original system
/// prompt identity when the reply leaves `system` out.
fn adopt_reply(original: &RequestEnvelope, mut fields: Map<String, Value>) -> RequestEnvelope {
    let system = fields.remove(SYSTEM_FIELD);
    let mut env = RequestEnvelope::from_map(fields);
    match system {
        None => env.inherit_system(original),
        Some(Value::Null) => env.set_system(None),
        Some(value) => env.set_system(Some(value)),
    }
    env
}

#[derive(Default, Deserialize)]
struct FollowupReply {
    #[serde(default)]
    response: Option<Value>,
}

pub struct HttpExtension {
    name: String,
    def: HttpExtensionDefinition,
    client: reqwest::Client,
}

impl HttpExtension {
    pub fn new(name: impl Into<String>, def: HttpExtensionDefinition) -> Result<Self, ExtensionError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(def.timeout_ms))
            .build()?;
        Ok(Self {
            name: name.into(),
            def,
            client,
        })
    }

    fn endpoint(&self, hook: HookKind) -> String {
        format!("{}/{}", self.def.url.trim_end_matches('/'), hook.path())
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        hook: HookKind,
        body: &B,
    ) -> Result<Value, ExtensionError> {
        let mut rb = self.client.post(self.endpoint(hook)).json(body);
        if let Some(tok) = &self.def.bearer_token {
            rb = rb.bearer_auth(tok);
        }
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ExtensionError::Status {
                hook: hook.path(),
                status: status.as_u16(),
            });
        }
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|source| ExtensionError::Decode {
            hook: hook.path(),
            source,
        })
    }

    fn decode<T: serde::de::DeserializeOwned + Default>(
        hook: HookKind,
        value: Value,
    ) -> Result<T, ExtensionError> {
        if value.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(value).map_err(|source| ExtensionError::Decode {
            hook: hook.path(),
            source,
        })
    }
}

#[async_trait::async_trait]
impl Extension for HttpExtension {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pre_call(
        &self,
        ctx: &PreCallContext,
        data: RequestEnvelope,
    ) -> Result<Option<RequestEnvelope>, ExtensionError> {
        if !self.def.exposes(HookKind::PreCall) {
            return Ok(None);
        }
        let reply = self
            .call(HookKind::PreCall, &json!({ "context": ctx, "data": &data }))
            .await?;
        let reply: PreCallReply = Self::decode(HookKind::PreCall, reply)?;
        Ok(reply.data.map(|fields| adopt_reply(&data, fields)))
    }

    async fn log_success(
        &self,
        ctx: &LogContext,
        response: Option<&Value>,
    ) -> Result<(), ExtensionError> {
        if !self.def.exposes(HookKind::LogSuccess) {
            return Ok(());
        }
        self.call(
            HookKind::LogSuccess,
            &json!({ "context": ctx, "response": response }),
        )
        .await
        .map(|_| ())
    }

    async fn log_failure(&self, ctx: &LogContext, error: &str) -> Result<(), ExtensionError> {
        if !self.def.exposes(HookKind::LogFailure) {
            return Ok(());
        }
        self.call(
            HookKind::LogFailure,
            &json!({ "context": ctx, "error": error }),
        )
        .await
        .map(|_| ())
    }

    async fn should_run_followup_loop(
        &self,
        req: &LoopRequest<'_>,
    ) -> Result<LoopDecision, ExtensionError> {
        if !self.def.exposes(HookKind::ShouldRunFollowupLoop) {
            return Ok(LoopDecision::skip());
        }
        let reply = self.call(HookKind::ShouldRunFollowupLoop, req).await?;
        Self::decode(HookKind::ShouldRunFollowupLoop, reply)
    }

    async fn run_followup_loop(
        &self,
        loop_context: Value,
        req: &FollowupRequest<'_>,
    ) -> Result<Option<LoopResponse>, ExtensionError> {
        if !self.def.exposes(HookKind::RunFollowupLoop) {
            return Ok(None);
        }
        let reply = self
            .call(
                HookKind::RunFollowupLoop,
                &json!({ "loop_context": loop_context, "request": req }),
            )
            .await?;
        let reply: FollowupReply = Self::decode(HookKind::RunFollowupLoop, reply)?;
        match reply.response {
            None | Some(Value::Null) => Ok(None),
            Some(obj @ Value::Object(_)) => Ok(Some(LoopResponse::Raw(obj))),
            Some(_) => Err(ExtensionError::Hook(
                "run_followup_loop response must be an object".into(),
            )),
        }
    }
}
