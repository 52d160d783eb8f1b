//! In-memory `MemoryClient` used by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chatmem_core::error::{EntityKind, MemoryError, Result};
use chatmem_core::{ExternalMessage, ExternalSession, ExternalUser, MemoryClient, Metadata, UserUpdate};
use chrono::Utc;

#[derive(Default)]
struct State {
    users: HashMap<String, ExternalUser>,
    /// Creation order preserved; listing reverses it.
    sessions: Vec<ExternalSession>,
    messages: HashMap<String, Vec<ExternalMessage>>,
    /// Canned search results: query text -> session ids in relevance order.
    search_results: HashMap<String, Vec<String>>,
}

#[derive(Default)]
pub struct InMemoryClient {
    state: Mutex<State>,
    next_session: AtomicUsize,
    next_message: AtomicUsize,
    pub create_session_calls: AtomicUsize,
    pub append_calls: AtomicUsize,
    pub metadata_writes: AtomicUsize,
    pub fail_metadata_writes: Mutex<bool>,
    pub fail_appends: Mutex<bool>,
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_search_results(&self, query: &str, session_ids: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .search_results
            .insert(query.to_string(), session_ids.iter().map(|s| s.to_string()).collect());
    }

    pub fn stored_messages(&self, session_id: &str) -> Vec<ExternalMessage> {
        self.state
            .lock()
            .unwrap()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn push_raw_message(&self, session_id: &str, message: ExternalMessage) {
        self.state
            .lock()
            .unwrap()
            .messages
            .entry(session_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn stored_session(&self, session_id: &str) -> Option<ExternalSession> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned()
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

fn user_not_found(id: &str) -> MemoryError {
    MemoryError::NotFound {
        entity: EntityKind::User,
        id: id.to_string(),
    }
}

fn session_not_found(id: &str) -> MemoryError {
    MemoryError::NotFound {
        entity: EntityKind::Session,
        id: id.to_string(),
    }
}

#[async_trait]
impl MemoryClient for InMemoryClient {
    async fn create_user(&self, user: &ExternalUser) -> Result<ExternalUser> {
        let mut state = self.state.lock().unwrap();
        if state.users.contains_key(&user.user_id) {
            return Err(MemoryError::Conflict {
                entity: EntityKind::User,
                id: user.user_id.clone(),
            });
        }
        let mut stored = user.clone();
        stored.created_at = Some(Utc::now().to_rfc3339());
        state.users.insert(user.user_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_user(&self, user_id: &str) -> Result<ExternalUser> {
        self.state
            .lock()
            .unwrap()
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| user_not_found(user_id))
    }

    async fn update_user(&self, user_id: &str, update: &UserUpdate) -> Result<ExternalUser> {
        let mut state = self.state.lock().unwrap();
        let user = state.users.get_mut(user_id).ok_or_else(|| user_not_found(user_id))?;
        if update.email.is_some() {
            user.email = update.email.clone();
        }
        if update.first_name.is_some() {
            user.first_name = update.first_name.clone();
        }
        if update.last_name.is_some() {
            user.last_name = update.last_name.clone();
        }
        if update.metadata.is_some() {
            user.metadata = update.metadata.clone();
        }
        Ok(user.clone())
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .users
            .remove(user_id)
            .map(|_| ())
            .ok_or_else(|| user_not_found(user_id))
    }

    async fn create_session(&self, user_id: &str, metadata: Metadata) -> Result<ExternalSession> {
        self.create_session_calls.fetch_add(1, Ordering::SeqCst);
        let n = self.next_session.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if !state.users.contains_key(user_id) {
            return Err(user_not_found(user_id));
        }
        let now = Utc::now().to_rfc3339();
        let session = ExternalSession {
            session_id: format!("session-{n}"),
            user_id: Some(user_id.to_string()),
            created_at: Some(now.clone()),
            updated_at: Some(now),
            metadata: Some(metadata),
        };
        state.sessions.push(session.clone());
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<ExternalSession> {
        self.stored_session(session_id)
            .ok_or_else(|| session_not_found(session_id))
    }

    async fn list_sessions(&self, user_id: &str, limit: usize, offset: usize) -> Result<Vec<ExternalSession>> {
        let state = self.state.lock().unwrap();
        if !state.users.contains_key(user_id) {
            return Err(user_not_found(user_id));
        }
        Ok(state
            .sessions
            .iter()
            .rev()
            .filter(|s| s.user_id.as_deref() == Some(user_id))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn search_sessions(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<ExternalSession>> {
        let state = self.state.lock().unwrap();
        let ids = state.search_results.get(query).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.sessions.iter().find(|s| &s.session_id == id))
            .filter(|s| s.user_id.as_deref() == Some(user_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_session_metadata(&self, session_id: &str, metadata: Metadata) -> Result<()> {
        if *self.fail_metadata_writes.lock().unwrap() {
            return Err(MemoryError::Api {
                code: 503,
                message: "metadata store unavailable".into(),
            });
        }
        self.metadata_writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .iter_mut()
            .find(|s| s.session_id == session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        session.metadata = Some(metadata);
        session.updated_at = Some(Utc::now().to_rfc3339());
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.sessions.len();
        state.sessions.retain(|s| s.session_id != session_id);
        if state.sessions.len() == before {
            return Err(session_not_found(session_id));
        }
        state.messages.remove(session_id);
        Ok(())
    }

    async fn append_messages(&self, session_id: &str, messages: &[ExternalMessage]) -> Result<()> {
        if *self.fail_appends.lock().unwrap() {
            return Err(MemoryError::Api {
                code: 500,
                message: "append failed".into(),
            });
        }
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if !state.sessions.iter().any(|s| s.session_id == session_id) {
            return Err(session_not_found(session_id));
        }
        // The service assigns its own message uuids.
        let stored = messages.iter().cloned().map(|mut m| {
            m.uuid = Some(format!("zep-{}", self.next_message.fetch_add(1, Ordering::SeqCst)));
            m
        });
        state
            .messages
            .entry(session_id.to_string())
            .or_default()
            .extend(stored);
        Ok(())
    }

    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<ExternalMessage>> {
        let state = self.state.lock().unwrap();
        if !state.sessions.iter().any(|s| s.session_id == session_id) {
            return Err(session_not_found(session_id));
        }
        let all = state.messages.get(session_id).cloned().unwrap_or_default();
        let end = match before {
            Some(cursor) => match all.iter().position(|m| m.uuid.as_deref() == Some(cursor)) {
                Some(pos) => pos,
                None => return Ok(Vec::new()),
            },
            None => all.len(),
        };
        Ok(all[end.saturating_sub(limit)..end].to_vec())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}
