use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::metadata::Metadata;
use crate::error::MemoryError;

/// A single chat turn. Immutable once appended to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Free-form role label: "user", "assistant", "system", tool roles, etc.
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build a message from a loose key/value mapping.
    ///
    /// `role` and `content` are required strings; `timestamp` (RFC 3339),
    /// `id` and `metadata` are optional.
    pub fn from_fields(fields: &Metadata) -> Result<Self, MemoryError> {
        let role = required_str(fields, "role")?;
        let content = required_str(fields, "content")?;
        let mut message = Self::new(role, content);
        if let Some(id) = optional_str(fields, "id")? {
            message.id = id.to_string();
        }
        if let Some(ts) = optional_timestamp(fields)? {
            message.timestamp = ts;
        }
        if let Some(metadata) = optional_object(fields, "metadata")? {
            message.metadata = metadata.clone();
        }
        Ok(message)
    }
}

/// A recorded tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub parameters: Metadata,
    /// `None` means no result was recorded; `Some(Value::Null)` is a null result.
    #[serde(default)]
    pub result: Option<Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, parameters: Metadata) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            parameters,
            result: None,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build a tool call from a loose mapping: `tool_name` (string) and
    /// `parameters` (object) are required.
    pub fn from_fields(fields: &Metadata) -> Result<Self, MemoryError> {
        let tool_name = required_str(fields, "tool_name")?;
        let parameters = optional_object(fields, "parameters")?
            .ok_or_else(|| MemoryError::Validation("missing required field 'parameters'".into()))?;
        let mut call = Self::new(tool_name, parameters.clone());
        call.result = fields.get("result").cloned();
        if let Some(id) = optional_str(fields, "id")? {
            call.id = id.to_string();
        }
        if let Some(ts) = optional_timestamp(fields)? {
            call.timestamp = ts;
        }
        if let Some(metadata) = optional_object(fields, "metadata")? {
            call.metadata = metadata.clone();
        }
        Ok(call)
    }
}

/// One item of session history, in append order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEntry {
    Message(Message),
    ToolCall(ToolCall),
}

impl SessionEntry {
    pub fn id(&self) -> &str {
        match self {
            SessionEntry::Message(m) => &m.id,
            SessionEntry::ToolCall(t) => &t.id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SessionEntry::Message(m) => m.timestamp,
            SessionEntry::ToolCall(t) => t.timestamp,
        }
    }
}

impl From<Message> for SessionEntry {
    fn from(message: Message) -> Self {
        SessionEntry::Message(message)
    }
}

impl From<ToolCall> for SessionEntry {
    fn from(call: ToolCall) -> Self {
        SessionEntry::ToolCall(call)
    }
}

fn required_str<'a>(fields: &'a Metadata, key: &str) -> Result<&'a str, MemoryError> {
    match fields.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(MemoryError::Validation(format!("field '{key}' must be a string"))),
        None => Err(MemoryError::Validation(format!("missing required field '{key}'"))),
    }
}

fn optional_str<'a>(fields: &'a Metadata, key: &str) -> Result<Option<&'a str>, MemoryError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(MemoryError::Validation(format!("field '{key}' must be a string"))),
    }
}

fn optional_object<'a>(fields: &'a Metadata, key: &str) -> Result<Option<&'a Metadata>, MemoryError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(MemoryError::Validation(format!("field '{key}' must be an object"))),
    }
}

fn optional_timestamp(fields: &Metadata) -> Result<Option<DateTime<Utc>>, MemoryError> {
    optional_str(fields, "timestamp")?
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| MemoryError::Validation(format!("invalid timestamp '{raw}': {e}")))
        })
        .transpose()
}
