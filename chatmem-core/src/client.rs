//! External memory service boundary.
//!
//! [`MemoryClient`] lists exactly the verbs the repository consumes. The
//! `External*` records mirror the service's JSON; nothing outside this module,
//! the adapter, and the entity `from_external` factories reads them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::Metadata;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalUser {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Mutable user fields for an update call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalSession {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// A message as the external service stores it. Every field is optional on
/// the wire; the adapter decides which ones are required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Verbs consumed from the external memory service.
///
/// Implementations map "no such record" to `MemoryError::NotFound` and
/// identity collisions to `MemoryError::Conflict`. Transport and auth
/// failures are returned as-is.
#[async_trait]
pub trait MemoryClient: Send + Sync {
    async fn create_user(&self, user: &ExternalUser) -> Result<ExternalUser>;

    async fn get_user(&self, user_id: &str) -> Result<ExternalUser>;

    async fn update_user(&self, user_id: &str, update: &UserUpdate) -> Result<ExternalUser>;

    async fn delete_user(&self, user_id: &str) -> Result<()>;

    /// Allocate a new session owned by `user_id`. The session id is chosen
    /// by the client or the service, never by the caller.
    async fn create_session(&self, user_id: &str, metadata: Metadata) -> Result<ExternalSession>;

    async fn get_session(&self, session_id: &str) -> Result<ExternalSession>;

    /// Sessions of one user, most recent first.
    async fn list_sessions(&self, user_id: &str, limit: usize, offset: usize) -> Result<Vec<ExternalSession>>;

    /// Text search over a user's sessions, in relevance order. `query` is
    /// passed through untouched.
    async fn search_sessions(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<ExternalSession>>;

    async fn update_session_metadata(&self, session_id: &str, metadata: Metadata) -> Result<()>;

    async fn delete_session(&self, session_id: &str) -> Result<()>;

    async fn append_messages(&self, session_id: &str, messages: &[ExternalMessage]) -> Result<()>;

    /// The last `limit` messages in chronological order. With `before`, only
    /// messages preceding the one whose service-assigned `uuid` equals
    /// `before`; an unknown cursor yields an empty list.
    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<ExternalMessage>>;

    fn name(&self) -> &str;
}
