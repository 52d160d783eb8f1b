use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::metadata::{tool_key, ManagedMetadata, Metadata, APPLICATION_NAMESPACE, TOOL_NAMESPACE};
use super::session::Session;
use crate::adapter::MetadataEnvelope;
use crate::client::ExternalUser;
use crate::error::{MemoryError, Result};
use crate::repository::SessionRepo;

/// A chat user, identified by a human-chosen `username`.
///
/// The username is the only identity: it is the external service's user id
/// and the owner key on every [`Session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub managed_metadata: ManagedMetadata,
    /// False once soft-deleted.
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl User {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: None,
            first_name: None,
            last_name: None,
            metadata: Metadata::new(),
            managed_metadata: ManagedMetadata::new(),
            active: true,
            created_at: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_name(mut self, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        self.first_name = Some(first_name.into());
        self.last_name = Some(last_name.into());
        self
    }

    /// Rebuild a user from the external service's record.
    pub fn from_external(record: ExternalUser) -> Self {
        let envelope = MetadataEnvelope::decode(record.metadata.as_ref());
        Self {
            username: record.user_id,
            email: record.email,
            first_name: record.first_name,
            last_name: record.last_name,
            metadata: envelope.metadata,
            managed_metadata: envelope.managed_metadata,
            active: envelope.active.unwrap_or(true),
            created_at: record.created_at.as_deref().and_then(crate::adapter::parse_timestamp),
        }
    }

    /// The external record this user would be created with.
    pub fn to_external(&self) -> ExternalUser {
        ExternalUser {
            user_id: self.username.clone(),
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            metadata: Some(self.metadata_envelope().encode()),
            created_at: None,
        }
    }

    pub(crate) fn metadata_envelope(&self) -> MetadataEnvelope {
        MetadataEnvelope {
            title: None,
            active: (!self.active).then_some(false),
            metadata: self.metadata.clone(),
            managed_metadata: self.managed_metadata.clone(),
        }
    }

    /// Check the fields required before anything is sent remotely.
    pub fn validate(&self) -> Result<()> {
        validate_identity(&self.username)?;
        if let Some(email) = &self.email {
            if !email.contains('@') {
                return Err(MemoryError::Validation(format!("invalid email address '{email}'")));
            }
        }
        Ok(())
    }

    pub fn get_meta(&self, key: &str, default: Value) -> Value {
        self.metadata.get(key).cloned().unwrap_or(default)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn get_managed_meta<'a>(&'a self, namespace: &str, key: &str, default: Option<&'a str>) -> Option<&'a str> {
        self.managed_metadata.get(namespace, key).or(default)
    }

    pub fn set_managed_meta(&mut self, namespace: &str, key: &str, value: impl Into<String>) {
        self.managed_metadata.set(namespace, key, value);
    }

    /// All managed keys of one namespace, with the namespace prefix stripped.
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

    /// Sessions owned by this user, fetched fresh from the repository.
    pub async fn get_sessions(&self, repo: &SessionRepo, limit: usize, offset: usize) -> Result<Vec<Session>> {
        repo.get_user_sessions(&self.username, limit, offset).await
    }

    pub async fn search_sessions(&self, repo: &SessionRepo, query: &str, limit: usize) -> Result<Vec<Session>> {
        repo.search_user_sessions(&self.username, query, limit).await
    }
}

/// Identities go into URL paths on the external service, so they must be
/// non-empty and free of path separators and whitespace.
pub fn validate_identity(identity: &str) -> Result<()> {
    if identity.is_empty() {
        return Err(MemoryError::Validation("identity must not be empty".into()));
    }
    if identity.contains('/') || identity.chars().any(char::is_whitespace) {
        return Err(MemoryError::Validation(format!(
            "identity '{identity}' must not contain '/' or whitespace"
        )));
    }
    Ok(())
}
