use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const PAYLOAD_MARKER: &str = "~~~WORKITEM~~~";

pub const ERROR_FIELD: &str = "error";
pub const TRACE_FIELD: &str = "trace";

#[derive(Debug, thiserror::Error)]
pub enum WorkitemError {
    #[error("malformed workitem payload: {source}")]
    MalformedPayload {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode workitem for instance {instance_id}: {source}")]
    Encode {
        instance_id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workitem {
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub participant_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step_id: String,
}

impl Workitem {
    pub fn new(instance_id: &str, fields: Map<String, Value>) -> Self {
        Self {
            fields,
            params: BTreeMap::new(),
            instance_id: instance_id.to_string(),
            participant_name: String::new(),
            step_id: String::new(),
        }
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn set_error(&mut self, message: &str) {
        self.fields
            .insert(ERROR_FIELD.to_string(), Value::String(message.to_string()));
    }

    pub fn set_trace(&mut self, detail: &str) {
        self.fields
            .insert(TRACE_FIELD.to_string(), Value::String(detail.to_string()));
    }
}

pub fn encode(workitem: &Workitem) -> Result<String, WorkitemError> {
    serde_json::to_string(workitem).map_err(|source| WorkitemError::Encode {
        instance_id: workitem.instance_id.clone(),
        source,
    })
}

pub fn decode(raw: &str) -> Result<Workitem, WorkitemError> {
    serde_json::from_str(raw).map_err(|source| WorkitemError::MalformedPayload { source })
}

pub fn extract_embedded(raw_text: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    for line in raw_text.lines() {
        if let Some(fragment) = line.strip_prefix(PAYLOAD_MARKER) {
            fragments.push(fragment.to_string());
        }
    }
    fragments
}
