//! Payload codecs tried in order until one succeeds
//!
//! Adapters translate between wire bytes and a `serde_json::Value`
//! intermediate; serde then maps that value onto the caller's type. The
//! first adapter whose output fits the requested type wins.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("{adapter} adapter cannot decode payload: {reason}")]
    Decode {
        adapter: &'static str,
        reason: String,
    },
    #[error("{adapter} adapter cannot encode value: {reason}")]
    Encode {
        adapter: &'static str,
        reason: String,
    },
    #[error("no message adapters configured")]
    NoAdapters,
}

pub trait MessageAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, payload: &[u8]) -> Result<Value, AdapterError>;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, AdapterError>;
}

/// Plain UTF-8 text; encodes only string values
#[derive(Debug, Clone, Copy, Default)]
pub struct TextMessageAdapter;

impl MessageAdapter for TextMessageAdapter {
    fn name(&self) -> &'static str {
        "text"
    }

    fn decode(&self, payload: &[u8]) -> Result<Value, AdapterError> {
        std::str::from_utf8(payload)
            .map(|text| Value::String(text.to_string()))
            .map_err(|e| AdapterError::Decode {
                adapter: self.name(),
                reason: e.to_string(),
            })
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, AdapterError> {
        match value {
            Value::String(text) => Ok(text.as_bytes().to_vec()),
            other => Err(AdapterError::Encode {
                adapter: self.name(),
                reason: format!("expected a string, found {}", json_type(other)),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMessageAdapter;

impl MessageAdapter for JsonMessageAdapter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, payload: &[u8]) -> Result<Value, AdapterError> {
        serde_json::from_slice(payload).map_err(|e| AdapterError::Decode {
            adapter: self.name(),
            reason: e.to_string(),
        })
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, AdapterError> {
        serde_json::to_vec(value).map_err(|e| AdapterError::Encode {
            adapter: self.name(),
            reason: e.to_string(),
        })
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Clone)]
pub struct MessageAdaptersCoordinator {
    adapters: Vec<Arc<dyn MessageAdapter>>,
}

impl MessageAdaptersCoordinator {
    pub fn new(adapters: Vec<Arc<dyn MessageAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn adapter_names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|adapter| adapter.name()).collect()
    }

    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, AdapterError> {
        let mut last_error = AdapterError::NoAdapters;
        for adapter in &self.adapters {
            let attempt = adapter.decode(payload).and_then(|value| {
                serde_json::from_value::<T>(value).map_err(|e| AdapterError::Decode {
                    adapter: adapter.name(),
                    reason: e.to_string(),
                })
            });
            match attempt {
                Ok(decoded) => return Ok(decoded),
                Err(e) => {
                    trace!(adapter = adapter.name(), error = %e, "Adapter declined payload");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, AdapterError> {
        let value = serde_json::to_value(value).map_err(|e| AdapterError::Encode {
            adapter: "serde",
            reason: e.to_string(),
        })?;

        let mut last_error = AdapterError::NoAdapters;
        for adapter in &self.adapters {
            match adapter.encode(&value) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

impl Default for MessageAdaptersCoordinator {
    fn default() -> Self {
        Self::new(vec![
            Arc::new(TextMessageAdapter),
            Arc::new(JsonMessageAdapter),
        ])
    }
}
