//! Session repository: the single point of contact between application code
//! and the external memory service.
//!
//! Every read goes to the service; nothing is cached. All reconstruction from
//! service records goes through `User::from_external` / `Session::from_external`.

use std::sync::Arc;

use futures::future::try_join_all;

use crate::adapter::{FormatAdapter, MetadataEnvelope, ZepAdapter};
use crate::client::{ExternalMessage, MemoryClient, UserUpdate};
use crate::config::{ChatmemConfig, ZepConfig};
use crate::error::{MemoryError, Result};
use crate::models::{validate_identity, FlushReport, Metadata, Session, SessionEntry, User};
use crate::zep_client::ZepClient;

pub const DEFAULT_MESSAGE_WINDOW: usize = 50;

#[derive(Clone)]
pub struct SessionRepo {
    client: Arc<dyn MemoryClient>,
    adapter: Arc<dyn FormatAdapter>,
    message_window: usize,
}

impl SessionRepo {
    /// Use a pre-built client handle.
    pub fn new(client: Arc<dyn MemoryClient>) -> Self {
        Self {
            client,
            adapter: Arc::new(ZepAdapter),
            message_window: DEFAULT_MESSAGE_WINDOW,
        }
    }

    /// Build a Zep client from credentials, with the API-key environment
    /// variable as fallback.
    pub fn from_config(config: &ZepConfig) -> Result<Self> {
        let client = ZepClient::new(config)?;
        tracing::info!(base_url = %config.base_url, "Session repository using Zep client");
        Ok(Self::new(Arc::new(client)))
    }

    pub fn from_app_config(config: &ChatmemConfig) -> Result<Self> {
        Ok(Self::from_config(&config.zep)?.with_message_window(config.repository.message_window))
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn FormatAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_message_window(mut self, message_window: usize) -> Self {
        self.message_window = message_window;
        self
    }

    pub fn client(&self) -> &dyn MemoryClient {
        self.client.as_ref()
    }

    pub fn adapter(&self) -> &dyn FormatAdapter {
        self.adapter.as_ref()
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Create the user remotely and return the service's canonical copy.
    pub async fn add_user(&self, user: User) -> Result<User> {
        user.validate()?;
        let created = self.client.create_user(&user.to_external()).await?;
        tracing::info!(user = %user.username, "Created user");
        Ok(User::from_external(created))
    }

    /// Push email, names and metadata for an existing user.
    pub async fn update_user(&self, user: &User) -> Result<User> {
        user.validate()?;
        let update = UserUpdate {
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            metadata: Some(user.metadata_envelope().encode()),
        };
        let updated = self.client.update_user(&user.username, &update).await?;
        tracing::info!(user = %user.username, "Updated user");
        Ok(User::from_external(updated))
    }

    /// Hard delete removes every session of the user, then the user. Soft
    /// delete only marks the user inactive and keeps its sessions.
    pub async fn delete_user(&self, username: &str, hard_delete: bool) -> Result<()> {
        validate_identity(username)?;
        let record = self.client.get_user(username).await?;

        if !hard_delete {
            let mut envelope = MetadataEnvelope::decode(record.metadata.as_ref());
            envelope.active = Some(false);
            let update = UserUpdate {
                metadata: Some(envelope.encode()),
                ..Default::default()
            };
            self.client.update_user(username, &update).await?;
            tracing::info!(user = %username, "Soft-deleted user");
            return Ok(());
        }

        let sessions = self.client.list_sessions(username, usize::MAX, 0).await?;
        try_join_all(
            sessions
                .iter()
                .map(|s| self.client.delete_session(&s.session_id)),
        )
        .await?;
        self.client.delete_user(username).await?;
        tracing::info!(user = %username, sessions = sessions.len(), "Hard-deleted user");
        Ok(())
    }

    pub async fn get_user(&self, username: &str) -> Result<User> {
        validate_identity(username)?;
        tracing::debug!(user = %username, "Fetching user");
        let record = self.client.get_user(username).await?;
        Ok(User::from_external(record))
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Allocate a session for an existing user. Fails with `NotFound` before
    /// any allocation if the user does not exist.
    pub async fn new_session(
        &self,
        username: &str,
        title: Option<&str>,
        initial_metadata: Option<Metadata>,
    ) -> Result<Session> {
        validate_identity(username)?;
        self.client.get_user(username).await?;

        let envelope = MetadataEnvelope {
            title: title.map(str::to_string),
            metadata: initial_metadata.unwrap_or_default(),
            ..Default::default()
        };
        let record = self.client.create_session(username, envelope.encode()).await?;
        tracing::info!(user = %username, session_id = %record.session_id, "Created session");
        Ok(Session::from_external(record, Vec::new()))
    }

    /// Sessions of a user, most recent first, without message history.
    pub async fn get_user_sessions(&self, username: &str, limit: usize, offset: usize) -> Result<Vec<Session>> {
        validate_identity(username)?;
        tracing::debug!(user = %username, limit, offset, "Listing sessions");
        let records = self.client.list_sessions(username, limit, offset).await?;
        Ok(records
            .into_iter()
            .take(limit)
            .map(|r| Session::from_external(r, Vec::new()))
            .collect())
    }

    /// Forward `query` verbatim to the service's search, in relevance order.
    pub async fn search_user_sessions(&self, username: &str, query: &str, limit: usize) -> Result<Vec<Session>> {
        validate_identity(username)?;
        tracing::debug!(user = %username, limit, "Searching sessions");
        let records = self.client.search_sessions(username, query, limit).await?;
        Ok(records
            .into_iter()
            .take(limit)
            .map(|r| Session::from_external(r, Vec::new()))
            .collect())
    }

    /// Load one session with its most recent history.
    pub async fn get_user_session(&self, username: &str, session_id: &str) -> Result<Session> {
        let record = self.owned_session(username, session_id).await?;
        let history = self.fetch_history(session_id, self.message_window, None).await?;
        Ok(Session::from_external(record, history))
    }

    pub async fn remove_user_session(&self, username: &str, session_id: &str) -> Result<()> {
        self.owned_session(username, session_id).await?;
        self.client.delete_session(session_id).await?;
        tracing::info!(user = %username, session_id = %session_id, "Removed session");
        Ok(())
    }

    /// Page backwards through a session's remote history.
    pub async fn get_session_messages(
        &self,
        username: &str,
        session_id: &str,
        limit: usize,
        before_id: Option<&str>,
    ) -> Result<Vec<SessionEntry>> {
        self.owned_session(username, session_id).await?;
        self.fetch_history(session_id, limit, before_id).await
    }

    /// Push a session's buffered changes through this repository's client.
    pub async fn flush(&self, session: &mut Session) -> Result<FlushReport> {
        session.flush(self.client.as_ref(), self.adapter.as_ref()).await
    }

    async fn owned_session(&self, username: &str, session_id: &str) -> Result<crate::client::ExternalSession> {
        validate_identity(username)?;
        validate_identity(session_id)?;
        let record = self.client.get_session(session_id).await?;
        if record.user_id.as_deref() != Some(username) {
            tracing::debug!(user = %username, session_id = %session_id, "Session belongs to another user");
            return Err(MemoryError::session_not_found(session_id));
        }
        Ok(record)
    }

    /// The `limit` entries preceding `before_id`, or the most recent `limit`.
    ///
    /// `before_id` is an application entry id, which the service does not
    /// index, so the tail is fetched in doubling windows until it holds the
    /// cursor and `limit` entries before it.
    async fn fetch_history(
        &self,
        session_id: &str,
        limit: usize,
        before_id: Option<&str>,
    ) -> Result<Vec<SessionEntry>> {
        let Some(cursor) = before_id else {
            let external = self.client.list_messages(session_id, limit, None).await?;
            return self.translate(session_id, &external);
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut fetch = limit.saturating_add(1).saturating_mul(2);
        loop {
            let external = self.client.list_messages(session_id, fetch, None).await?;
            let exhausted = external.len() < fetch;
            let mut entries = self.translate(session_id, &external)?;

            match entries.iter().position(|e| e.id() == cursor) {
                Some(pos) if pos >= limit || exhausted => {
                    entries.truncate(pos);
                    return Ok(entries.split_off(pos.saturating_sub(limit)));
                }
                None if exhausted => {
                    tracing::debug!(session_id = %session_id, before_id = %cursor, "Unknown history cursor");
                    return Ok(Vec::new());
                }
                _ => fetch = fetch.saturating_mul(2),
            }
        }
    }

    fn translate(&self, session_id: &str, external: &[ExternalMessage]) -> Result<Vec<SessionEntry>> {
        self.adapter.to_application_format(external).map_err(|e| {
            tracing::error!(session_id = %session_id, error = %e, "Could not translate session history");
            e.into()
        })
    }
}

impl std::fmt::Debug for SessionRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRepo")
            .field("client", &self.client.name())
            .field("message_window", &self.message_window)
            .finish()
    }
}
