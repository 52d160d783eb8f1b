//! Format adapter: translation between session history and the external
//! service's message records.
//!
//! External messages carry a `role_type` discriminant:
//! - `"tool"`: a [`ToolCall`]; `content` is a JSON document
//!   `{"tool_name", "parameters", "result"?}`
//! - `"user" | "assistant" | "system" | "function" | "norole"`: a [`Message`];
//!   the free-form role is kept verbatim in `role`
//!
//! Entry identity, timestamp and metadata travel in a `chatmem` envelope inside
//! the record's metadata so they survive a round trip exactly. Records written
//! by other clients (no envelope) fall back to `uuid` / `created_at`.
//!
//! User and session records use [`MetadataEnvelope`] for their metadata.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::client::ExternalMessage;
use crate::error::FormatError;
use crate::models::{ManagedMetadata, Message, Metadata, SessionEntry, ToolCall};

const ENTRY_ENVELOPE_KEY: &str = "chatmem";
const TOOL_ROLE_TYPE: &str = "tool";
const NO_ROLE_TYPE: &str = "norole";
const MESSAGE_ROLE_TYPES: [&str; 5] = ["user", "assistant", "system", "function", NO_ROLE_TYPE];

/// Bidirectional translator between session history and an external format.
pub trait FormatAdapter: Send + Sync {
    fn to_external_format(&self, entries: &[SessionEntry]) -> Vec<ExternalMessage>;

    /// Inverse of [`FormatAdapter::to_external_format`]. Fails on the first
    /// record it cannot translate.
    fn to_application_format(&self, messages: &[ExternalMessage]) -> Result<Vec<SessionEntry>, FormatError>;
}

/// Adapter for the Zep Cloud message shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZepAdapter;

impl FormatAdapter for ZepAdapter {
    fn to_external_format(&self, entries: &[SessionEntry]) -> Vec<ExternalMessage> {
        entries.iter().map(encode_entry).collect()
    }

    fn to_application_format(&self, messages: &[ExternalMessage]) -> Result<Vec<SessionEntry>, FormatError> {
        messages
            .iter()
            .enumerate()
            .map(|(index, record)| decode_entry(index, record))
            .collect()
    }
}

fn role_type_for(role: &str) -> &'static str {
    MESSAGE_ROLE_TYPES
        .iter()
        .find(|rt| **rt == role)
        .copied()
        .unwrap_or(NO_ROLE_TYPE)
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
}

fn entry_envelope(id: &str, timestamp: &DateTime<Utc>, metadata: &Metadata) -> Metadata {
    let mut inner = Metadata::new();
    inner.insert("id".into(), Value::String(id.to_string()));
    inner.insert("timestamp".into(), Value::String(format_timestamp(timestamp)));
    inner.insert("metadata".into(), Value::Object(metadata.clone()));

    let mut outer = Metadata::new();
    outer.insert(ENTRY_ENVELOPE_KEY.into(), Value::Object(inner));
    outer
}

fn encode_entry(entry: &SessionEntry) -> ExternalMessage {
    match entry {
        SessionEntry::Message(m) => ExternalMessage {
            uuid: Some(m.id.clone()),
            role: Some(m.role.clone()),
            role_type: Some(role_type_for(&m.role).to_string()),
            content: Some(m.content.clone()),
            created_at: Some(format_timestamp(&m.timestamp)),
            metadata: Some(entry_envelope(&m.id, &m.timestamp, &m.metadata)),
        },
        SessionEntry::ToolCall(t) => {
            let mut body = Metadata::new();
            body.insert("tool_name".into(), Value::String(t.tool_name.clone()));
            body.insert("parameters".into(), Value::Object(t.parameters.clone()));
            if let Some(result) = &t.result {
                body.insert("result".into(), result.clone());
            }
            ExternalMessage {
                uuid: Some(t.id.clone()),
                role: Some(t.tool_name.clone()),
                role_type: Some(TOOL_ROLE_TYPE.to_string()),
                content: Some(Value::Object(body).to_string()),
                created_at: Some(format_timestamp(&t.timestamp)),
                metadata: Some(entry_envelope(&t.id, &t.timestamp, &t.metadata)),
            }
        }
    }
}

/// Identity, timestamp and metadata of a record, from the envelope when
/// present, otherwise from the record itself.
struct EntryHeader {
    id: String,
    timestamp: DateTime<Utc>,
    metadata: Metadata,
}

fn decode_header(index: usize, record: &ExternalMessage) -> Result<EntryHeader, FormatError> {
    let envelope = record
        .metadata
        .as_ref()
        .and_then(|m| m.get(ENTRY_ENVELOPE_KEY))
        .and_then(Value::as_object);

    let Some(envelope) = envelope else {
        let id = record
            .uuid
            .clone()
            .ok_or_else(|| FormatError::new(index, "missing message id"))?;
        let timestamp = record
            .created_at
            .as_deref()
            .ok_or_else(|| FormatError::new(index, "missing timestamp"))?;
        let timestamp = parse_timestamp(timestamp)
            .ok_or_else(|| FormatError::new(index, format!("invalid timestamp '{timestamp}'")))?;
        return Ok(EntryHeader {
            id,
            timestamp,
            metadata: record.metadata.clone().unwrap_or_default(),
        });
    };

    let id = envelope
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| FormatError::new(index, "envelope missing 'id'"))?
        .to_string();
    let raw_ts = envelope
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| FormatError::new(index, "envelope missing 'timestamp'"))?;
    let timestamp = parse_timestamp(raw_ts)
        .ok_or_else(|| FormatError::new(index, format!("invalid timestamp '{raw_ts}'")))?;
    let metadata = match envelope.get("metadata") {
        None | Some(Value::Null) => Metadata::new(),
        Some(Value::Object(m)) => m.clone(),
        Some(_) => return Err(FormatError::new(index, "envelope 'metadata' is not an object")),
    };
    Ok(EntryHeader { id, timestamp, metadata })
}

#[derive(Deserialize)]
struct ToolCallBody {
    tool_name: String,
    parameters: Metadata,
    #[serde(default, deserialize_with = "present_value")]
    result: Option<Value>,
}

/// Keeps an explicit `null` as `Some(Value::Null)`; only an absent key is `None`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn decode_entry(index: usize, record: &ExternalMessage) -> Result<SessionEntry, FormatError> {
    let role_type = record
        .role_type
        .as_deref()
        .ok_or_else(|| FormatError::new(index, "missing 'role_type'"))?;
    let content = record
        .content
        .as_deref()
        .ok_or_else(|| FormatError::new(index, "missing 'content'"))?;

    if role_type == TOOL_ROLE_TYPE {
        let header = decode_header(index, record)?;
        let body: ToolCallBody = serde_json::from_str(content)
            .map_err(|e| FormatError::new(index, format!("tool call content is not valid: {e}")))?;
        return Ok(SessionEntry::ToolCall(ToolCall {
            id: header.id,
            tool_name: body.tool_name,
            parameters: body.parameters,
            result: body.result,
            timestamp: header.timestamp,
            metadata: header.metadata,
        }));
    }

    if !MESSAGE_ROLE_TYPES.contains(&role_type) {
        return Err(FormatError::new(index, format!("unknown role_type '{role_type}'")));
    }
    let role = record
        .role
        .clone()
        .unwrap_or_else(|| role_type.to_string());
    let header = decode_header(index, record)?;
    Ok(SessionEntry::Message(Message {
        id: header.id,
        role,
        content: content.to_string(),
        timestamp: header.timestamp,
        metadata: header.metadata,
    }))
}

/// Layout of user and session metadata on the external service:
/// `{title?, active?, metadata: {..}, managed_metadata: {"ns:key": ".."}}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataEnvelope {
    pub title: Option<String>,
    pub active: Option<bool>,
    pub metadata: Metadata,
    pub managed_metadata: ManagedMetadata,
}

impl MetadataEnvelope {
    /// Lenient: unknown keys are ignored and malformed sections are dropped
    /// with a warning rather than failing the whole record.
    pub fn decode(raw: Option<&Metadata>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        let title = raw.get("title").and_then(Value::as_str).map(str::to_string);
        let active = raw.get("active").and_then(Value::as_bool);
        let metadata = match raw.get("metadata") {
            Some(Value::Object(m)) => m.clone(),
            None | Some(Value::Null) => Metadata::new(),
            Some(other) => {
                tracing::warn!(value = %other, "Ignoring non-object 'metadata' in external record");
                Metadata::new()
            }
        };
        let managed_metadata = match raw.get("managed_metadata") {
            Some(Value::Object(m)) => {
                let flat = m
                    .iter()
                    .filter_map(|(k, v)| match v {
                        _ if ManagedMetadata::split_flat_key(k).is_none() => {
                            tracing::warn!(key = %k, "Ignoring managed metadata key without a namespace");
                            None
                        }
                        Value::String(s) => Some((k.clone(), s.clone())),
                        _ => {
                            tracing::warn!(key = %k, "Ignoring non-string managed metadata value");
                            None
                        }
                    })
                    .collect::<std::collections::BTreeMap<_, _>>();
                ManagedMetadata::from(flat)
            }
            _ => ManagedMetadata::new(),
        };
        Self {
            title,
            active,
            metadata,
            managed_metadata,
        }
    }

    pub fn encode(&self) -> Metadata {
        let mut out = Metadata::new();
        if let Some(title) = &self.title {
            out.insert("title".into(), Value::String(title.clone()));
        }
        if let Some(active) = self.active {
            out.insert("active".into(), Value::Bool(active));
        }
        out.insert("metadata".into(), Value::Object(self.metadata.clone()));
        let managed = self
            .managed_metadata
            .as_flat()
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        out.insert("managed_metadata".into(), Value::Object(managed));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_message_round_trip() {
        let message = Message::new("user", "Hello, Agent C!").with_metadata(obj(json!({"lang": "en"})));
        let entries = vec![SessionEntry::Message(message)];

        let external = ZepAdapter.to_external_format(&entries);
        assert_eq!(external[0].role_type.as_deref(), Some("user"));

        let back = ZepAdapter.to_application_format(&external).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn test_mixed_history_round_trip() {
        let entries = vec![
            SessionEntry::Message(Message::system("be brief")),
            SessionEntry::Message(Message::new("retriever", "{\"docs\": [1, 2]}")),
            SessionEntry::ToolCall(
                ToolCall::new("search", obj(json!({"q": "rust", "depth": 2})))
                    .with_result(json!({"hits": ["a", "b"]})),
            ),
            SessionEntry::ToolCall(ToolCall::new("noop", Metadata::new()).with_result(Value::Null)),
            SessionEntry::ToolCall(ToolCall::new("pending", Metadata::new())),
            SessionEntry::Message(Message::assistant("done")),
        ];

        let external = ZepAdapter.to_external_format(&entries);
        assert_eq!(external[1].role_type.as_deref(), Some("norole"));
        assert_eq!(external[1].role.as_deref(), Some("retriever"));
        assert_eq!(external[2].role_type.as_deref(), Some("tool"));

        let back = ZepAdapter.to_application_format(&external).unwrap();
        assert_eq!(back, entries);
    }

    #[test]
    fn test_tool_role_message_is_not_a_tool_call() {
        let entries = vec![SessionEntry::Message(Message::new("tool", "plain text from a tool"))];
        let external = ZepAdapter.to_external_format(&entries);
        assert_eq!(external[0].role_type.as_deref(), Some("norole"));
        assert_eq!(ZepAdapter.to_application_format(&external).unwrap(), entries);
    }

    #[test]
    fn test_foreign_record_without_envelope() {
        let record = ExternalMessage {
            uuid: Some("abc".into()),
            role: Some("user".into()),
            role_type: Some("user".into()),
            content: Some("hi".into()),
            created_at: Some("2024-07-01T12:00:00Z".into()),
            metadata: Some(obj(json!({"source": "slack"}))),
        };
        let back = ZepAdapter.to_application_format(&[record]).unwrap();
        match &back[0] {
            SessionEntry::Message(m) => {
                assert_eq!(m.id, "abc");
                assert_eq!(m.metadata["source"], "slack");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_discriminant_reports_position() {
        let mut external = ZepAdapter.to_external_format(&[
            SessionEntry::Message(Message::user("ok")),
            SessionEntry::Message(Message::user("broken")),
        ]);
        external[1].role_type = None;

        let err = ZepAdapter.to_application_format(&external).unwrap_err();
        assert_eq!(err.index, 1);
        assert!(err.reason.contains("role_type"));
    }

    #[test]
    fn test_missing_content_and_bad_tool_payload() {
        let mut external = ZepAdapter.to_external_format(&[SessionEntry::Message(Message::user("x"))]);
        external[0].content = None;
        let err = ZepAdapter.to_application_format(&external).unwrap_err();
        assert_eq!(err.index, 0);
        assert!(err.reason.contains("content"));

        let mut external =
            ZepAdapter.to_external_format(&[SessionEntry::ToolCall(ToolCall::new("t", Metadata::new()))]);
        external[0].content = Some("not json".into());
        let err = ZepAdapter.to_application_format(&external).unwrap_err();
        assert!(err.reason.contains("tool call"));
    }

    #[test]
    fn test_unknown_role_type_is_rejected() {
        let mut external = ZepAdapter.to_external_format(&[SessionEntry::Message(Message::user("x"))]);
        external[0].role_type = Some("robot".into());
        let err = ZepAdapter.to_application_format(&external).unwrap_err();
        assert!(err.reason.contains("robot"));
    }

    #[test]
    fn test_metadata_envelope_round_trip() {
        let mut managed = ManagedMetadata::new();
        managed.set("application", "language", "en-US");
        let envelope = MetadataEnvelope {
            title: Some("Getting Started".into()),
            active: Some(false),
            metadata: obj(json!({"topic": "Introduction"})),
            managed_metadata: managed,
        };
        let encoded = envelope.encode();
        assert_eq!(encoded["managed_metadata"]["application:language"], "en-US");
        assert_eq!(MetadataEnvelope::decode(Some(&encoded)), envelope);
    }

    #[test]
    fn test_metadata_envelope_tolerates_foreign_shapes() {
        let raw = obj(json!({"metadata": 5, "managed_metadata": {"a:b": 1, "c:d": "ok"}}));
        let envelope = MetadataEnvelope::decode(Some(&raw));
        assert!(envelope.metadata.is_empty());
        assert_eq!(envelope.managed_metadata.get("c", "d"), Some("ok"));
        assert_eq!(envelope.managed_metadata.len(), 1);
    }

    #[test]
    fn test_metadata_envelope_keeps_escaped_namespaces_apart() {
        let mut managed = ManagedMetadata::new();
        managed.set("a:b", "c", "first");
        managed.set("a", "b:c", "second");
        let envelope = MetadataEnvelope {
            managed_metadata: managed,
            ..Default::default()
        };

        let mut encoded = envelope.encode();
        encoded["managed_metadata"]
            .as_object_mut()
            .unwrap()
            .insert("orphan".into(), json!("dropped"));

        let decoded = MetadataEnvelope::decode(Some(&encoded));
        assert_eq!(decoded.managed_metadata.get("a:b", "c"), Some("first"));
        assert_eq!(decoded.managed_metadata.get("a", "b:c"), Some("second"));
        assert_eq!(decoded.managed_metadata.len(), 2);
    }
}
