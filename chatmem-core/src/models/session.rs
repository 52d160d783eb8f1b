use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::{Message, SessionEntry, ToolCall};
use super::metadata::{tool_key, ManagedMetadata, Metadata, APPLICATION_NAMESPACE, TOOL_NAMESPACE};
use crate::adapter::{parse_timestamp, FormatAdapter, MetadataEnvelope};
use crate::client::{ExternalSession, MemoryClient};
use crate::error::{MemoryError, Result};

/// A chat session.
///
/// Mutations (`add_message`, `add_interaction`, `add_tool_call`, `set_meta`,
/// `set_managed_meta`) only touch in-memory state. Nothing reaches the
/// external service until [`Session::flush`]. A session is not synchronized
/// internally; concurrent writers must serialize through one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub managed_metadata: ManagedMetadata,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Entries appended since the last flush, interleaved in append order.
    #[serde(skip)]
    pending: Vec<SessionEntry>,
    #[serde(skip)]
    metadata_dirty: bool,
}

/// What a successful [`Session::flush`] pushed to the external service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub entries_written: usize,
    pub metadata_written: bool,
}

impl FlushReport {
    pub fn is_noop(&self) -> bool {
        self.entries_written == 0 && !self.metadata_written
    }
}

impl Session {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            title: None,
            created_at: now,
            updated_at: now,
            metadata: Metadata::new(),
            managed_metadata: ManagedMetadata::new(),
            messages: Vec::new(),
            tool_calls: Vec::new(),
            pending: Vec::new(),
            metadata_dirty: false,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Rebuild a session from the external record plus already-translated
    /// history. The result has no pending changes.
    pub fn from_external(record: ExternalSession, history: Vec<SessionEntry>) -> Self {
        let envelope = MetadataEnvelope::decode(record.metadata.as_ref());
        let created_at = record
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);
        let updated_at = record
            .updated_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(created_at);

        let mut messages = Vec::new();
        let mut tool_calls = Vec::new();
        for entry in history {
            match entry {
                SessionEntry::Message(m) => messages.push(m),
                SessionEntry::ToolCall(t) => tool_calls.push(t),
            }
        }

        Self {
            session_id: record.session_id,
            user_id: record.user_id.unwrap_or_default(),
            title: envelope.title,
            created_at,
            updated_at,
            metadata: envelope.metadata,
            managed_metadata: envelope.managed_metadata,
            messages,
            tool_calls,
            pending: Vec::new(),
            metadata_dirty: false,
        }
    }

    pub(crate) fn metadata_envelope(&self) -> MetadataEnvelope {
        MetadataEnvelope {
            title: self.title.clone(),
            active: None,
            metadata: self.metadata.clone(),
            managed_metadata: self.managed_metadata.clone(),
        }
    }

    /// Advance `updated_at`, strictly, even if the clock has not moved.
    fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::microseconds(1)
        };
    }

    pub fn add_message(&mut self, message: Message) {
        self.pending.push(SessionEntry::Message(message.clone()));
        self.messages.push(message);
        self.touch();
    }

    /// Validate a loose mapping and append it as a message. On error the
    /// session is left untouched.
    pub fn add_message_from_fields(&mut self, fields: &Metadata) -> Result<()> {
        let message = Message::from_fields(fields)?;
        self.add_message(message);
        Ok(())
    }

    /// Append several messages as one unit with a single `updated_at` bump.
    /// An empty batch changes nothing.
    pub fn add_interaction(&mut self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        for message in messages {
            self.pending.push(SessionEntry::Message(message.clone()));
            self.messages.push(message);
        }
        self.touch();
    }

    pub fn add_tool_call(&mut self, tool_call: ToolCall) {
        self.pending.push(SessionEntry::ToolCall(tool_call.clone()));
        self.tool_calls.push(tool_call);
        self.touch();
    }

    pub fn add_tool_call_from_fields(&mut self, fields: &Metadata) -> Result<()> {
        let call = ToolCall::from_fields(fields)?;
        self.add_tool_call(call);
        Ok(())
    }

    /// The last `limit` messages in append order. With `before_id`, only
    /// messages strictly before that message are considered; an unknown
    /// `before_id` yields nothing.
    pub fn get_messages(&self, limit: usize, before_id: Option<&str>) -> &[Message] {
        let end = match before_id {
            Some(id) => match self.messages.iter().position(|m| m.id == id) {
                Some(pos) => pos,
                None => return &[],
            },
            None => self.messages.len(),
        };
        let start = end.saturating_sub(limit);
        &self.messages[start..end]
    }

    pub fn get_meta(&self, key: &str, default: Value) -> Value {
        self.metadata.get(key).cloned().unwrap_or(default)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
        self.metadata_dirty = true;
        self.touch();
    }

    pub fn get_managed_meta<'a>(&'a self, namespace: &str, key: &str, default: Option<&'a str>) -> Option<&'a str> {
        self.managed_metadata.get(namespace, key).or(default)
    }

    pub fn set_managed_meta(&mut self, namespace: &str, key: &str, value: impl Into<String>) {
        self.managed_metadata.set(namespace, key, value);
        self.metadata_dirty = true;
        self.touch();
    }

    pub fn managed_namespace(&self, namespace: &str) -> BTreeMap<String, String> {
        self.managed_metadata
            .namespace(namespace)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn get_tool_metadata<'a>(&'a self, tool_name: &str, key: &str, default: Option<&'a str>) -> Option<&'a str> {
        self.get_managed_meta(TOOL_NAMESPACE, &tool_key(tool_name, key), default)
    }

    pub fn set_tool_metadata(&mut self, tool_name: &str, key: &str, value: impl Into<String>) {
        self.set_managed_meta(TOOL_NAMESPACE, &tool_key(tool_name, key), value);
    }

    pub fn get_application_metadata<'a>(&'a self, key: &str, default: Option<&'a str>) -> Option<&'a str> {
        self.get_managed_meta(APPLICATION_NAMESPACE, key, default)
    }

    pub fn set_application_metadata(&mut self, key: &str, value: impl Into<String>) {
        self.set_managed_meta(APPLICATION_NAMESPACE, key, value);
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty() || self.metadata_dirty
    }

    pub fn pending_entries(&self) -> &[SessionEntry] {
        &self.pending
    }

    /// Push buffered entries, then buffered metadata, to the external service.
    ///
    /// Local state is only updated after each remote call returns, so a
    /// cancelled flush leaves the buffers as they were. If entries were
    /// written but the metadata write failed, the entries are no longer
    /// pending and the error is [`MemoryError::PartialFlush`].
    pub async fn flush(&mut self, client: &dyn MemoryClient, adapter: &dyn FormatAdapter) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        if !self.has_pending_changes() {
            tracing::debug!(session_id = %self.session_id, "Nothing to flush");
            return Ok(report);
        }

        if !self.pending.is_empty() {
            let external = adapter.to_external_format(&self.pending);
            client.append_messages(&self.session_id, &external).await?;
            report.entries_written = self.pending.len();
            self.pending.clear();
        }

        if self.metadata_dirty {
            let envelope = self.metadata_envelope().encode();
            match client.update_session_metadata(&self.session_id, envelope).await {
                Ok(()) => {
                    self.metadata_dirty = false;
                    report.metadata_written = true;
                }
                Err(e) if report.entries_written > 0 => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        entries_written = report.entries_written,
                        error = %e,
                        "Session metadata write failed after history was flushed"
                    );
                    return Err(MemoryError::PartialFlush {
                        entries_written: report.entries_written,
                        source: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            session_id = %self.session_id,
            entries = report.entries_written,
            metadata = report.metadata_written,
            "Flushed session"
        );
        Ok(report)
    }
}
