//! Request and response envelopes for the Messages API.
//!
//! The request side stays an untyped JSON mapping because the proxy must
//! forward fields it does not know about.  The system prompt is held behind
//! an `Arc` so that cloning an envelope keeps the same prompt *identity*; the
//! mutation flag compares identities, not values.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Internal field used by extensions to link hook invocations.  Never sent
/// upstream.
pub const CORRELATION_FIELD: &str = "_relay_request_id";

const SYSTEM_FIELD: &str = "system";

#[derive(Debug, Clone, Default)]
pub struct RequestEnvelope {
    fields: Map<String, Value>,
    system: Option<Arc<Value>>,
}

impl RequestEnvelope {
    pub fn from_map(mut fields: Map<String, Value>) -> Self {
        let system = fields.remove(SYSTEM_FIELD).map(Arc::new);
        Self { fields, system }
    }

    /// Parse a raw request body.  Anything other than a JSON object is
    /// rejected.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        let map: Map<String, Value> = serde_json::from_slice(body)?;
        Ok(Self::from_map(map))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        if key == SYSTEM_FIELD {
            return self.system.as_deref();
        }
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key == SYSTEM_FIELD {
            self.set_system(Some(value));
        } else {
            self.fields.insert(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        if key == SYSTEM_FIELD {
            return self
                .system
                .take()
                .map(|s| Arc::try_unwrap(s).unwrap_or_else(|shared| (*shared).clone()));
        }
        self.fields.remove(key)
    }

    pub fn system(&self) -> Option<&Value> {
        self.system.as_deref()
    }

    /// Replace the system prompt.  Always allocates a new identity, even when
    /// the value is equal to the current one.
    pub fn set_system(&mut self, value: Option<Value>) {
        self.system = value.map(Arc::new);
    }

    /// Share `other`'s system prompt, identity included.
    pub fn inherit_system(&mut self, other: &RequestEnvelope) {
        self.system = other.system.clone();
    }

    /// Identity comparison of the system prompts: two absent prompts are the
    /// same, two present prompts are the same only if they share storage.
    pub fn same_system(&self, other: &RequestEnvelope) -> bool {
        match (&self.system, &other.system) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn tools(&self) -> Option<&Vec<Value>> {
        self.fields.get("tools").and_then(Value::as_array)
    }

    pub fn tool_count(&self) -> usize {
        self.tools().map_or(0, Vec::len)
    }

    pub fn model(&self) -> &str {
        self.fields
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn messages(&self) -> &[Value] {
        self.fields
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_stream(&self) -> bool {
        self.fields
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn correlation_id(&self) -> Option<String> {
        match self.fields.get(CORRELATION_FIELD)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// All fields except the named ones, system prompt included.
    pub fn without(&self, keys: &[&str]) -> Map<String, Value> {
        let mut out = self.to_map();
        for key in keys {
            out.remove(*key);
        }
        out
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let mut out = self.fields.clone();
        if let Some(system) = &self.system {
            out.insert(SYSTEM_FIELD.to_string(), (**system).clone());
        }
        out
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.to_map())
    }

    /// Body sent upstream: the correlation field is stripped and the
    /// streaming flag forced to `stream`.
    pub fn outbound(&self, stream: bool) -> Value {
        let mut out = self.without(&[CORRELATION_FIELD]);
        out.insert("stream".to_string(), Value::Bool(stream));
        Value::Object(out)
    }
}

impl Serialize for RequestEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RequestEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Map::<String, Value>::deserialize(deserializer).map(Self::from_map)
    }
}

/// True when the returned envelope changed the tool count or carries a
/// different system prompt identity than the original.
pub fn is_mutated(original: &RequestEnvelope, returned: &RequestEnvelope) -> bool {
    returned.tool_count() != original.tool_count() || !returned.same_system(original)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Usage {
    /// Token counters of a raw unary response; missing or malformed usage
    /// yields empty counters.
    pub fn from_response(response: &Value) -> Self {
        response
            .get("usage")
            .cloned()
            .and_then(|u| serde_json::from_value(u).ok())
            .unwrap_or_default()
    }
}

fn default_message_type() -> String {
    "message".to_string()
}

fn default_role() -> String {
    "assistant".to_string()
}

/// Typed view of a unary Messages API response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_message_type")]
    pub kind: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageResponse {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Canonical JSON form.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
