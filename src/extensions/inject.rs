//! Compiled-in extension that adds operator-provided tools and system text
//! to every request.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{Extension, PreCallContext};
use crate::envelope::{RequestEnvelope, CORRELATION_FIELD};
use crate::error::ExtensionError;

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct InjectDefinition {
    /// Tool definitions appended to the request; a tool whose `name` is
    /// already present is skipped.
    #[serde(default)]
    pub tools: Vec<Value>,
    /// Text placed in front of the client's system prompt.
    #[serde(default)]
    pub system: Option<String>,
    /// Stamp each request with a fresh correlation id.
    #[serde(default)]
    pub correlate: bool,
}

pub struct InjectExtension {
    name: String,
    def: InjectDefinition,
}

impl InjectExtension {
    pub fn new(name: impl Into<String>, def: InjectDefinition) -> Self {
        Self {
            name: name.into(),
            def,
        }
    }

    fn merged_tools(&self, current: Option<&Vec<Value>>) -> Option<Vec<Value>> {
        let mut tools = current.cloned().unwrap_or_default();
        let before = tools.len();
        for tool in &self.def.tools {
            let name = tool.get("name");
            let duplicate = name.is_some() && tools.iter().any(|t| t.get("name") == name);
            if !duplicate {
                tools.push(tool.clone());
            }
        }
        (tools.len() != before).then_some(tools)
    }

    fn merged_system(&self, current: Option<&Value>) -> Option<Value> {
        let text = self.def.system.as_deref().filter(|s| !s.is_empty())?;
        let merged = match current {
            None | Some(Value::Null) => Value::String(text.to_string()),
            Some(Value::String(existing)) if existing.is_empty() => Value::String(text.to_string()),
            Some(Value::String(existing)) => Value::String(format!("{}\n\n{}", text, existing)),
            Some(Value::Array(blocks)) => {
                let mut out = Vec::with_capacity(blocks.len() + 1);
                out.push(json!({"type": "text", "text": text}));
                out.extend(blocks.iter().cloned());
                Value::Array(out)
            }
            Some(_) => return None,
        };
        Some(merged)
    }
}

#[async_trait::async_trait]
impl Extension for InjectExtension {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pre_call(
        &self,
        _ctx: &PreCallContext,
        mut data: RequestEnvelope,
    ) -> Result<Option<RequestEnvelope>, ExtensionError> {
        let tools = self.merged_tools(data.tools());
        let system = self.merged_system(data.system());
        if tools.is_none() && system.is_none() && !self.def.correlate {
            return Ok(None);
        }
        if let Some(tools) = tools {
            data.insert("tools", Value::Array(tools));
        }
        if let Some(system) = system {
            data.set_system(Some(system));
        }
        if self.def.correlate {
            data.insert(CORRELATION_FIELD, Value::String(uuid::Uuid::new_v4().to_string()));
        }
        Ok(Some(data))
    }
}
