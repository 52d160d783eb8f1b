//! Zep Cloud client: `MemoryClient` over the Zep v2 REST API.
//!
//! Reads are retried with jittered exponential backoff on throttling, server
//! errors and transport failures. Writes are sent once. Errors are returned
//! unchanged so callers can apply their own retry policy.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::client::{ExternalMessage, ExternalSession, ExternalUser, MemoryClient, UserUpdate};
use crate::config::ZepConfig;
use crate::error::{EntityKind, MemoryError, Result};
use crate::models::Metadata;

/// Page size used when walking a session's message history.
const MESSAGE_PAGE_SIZE: usize = 100;

// ============================================================================
// Zep API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    session_id: String,
    user_id: &'a str,
    metadata: Metadata,
}

#[derive(Debug, Serialize)]
struct UpdateSessionRequest {
    metadata: Metadata,
}

#[derive(Debug, Serialize)]
struct AddMemoryRequest<'a> {
    messages: &'a [ExternalMessage],
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    text: &'a str,
    user_id: &'a str,
    search_scope: &'static str,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<ExternalMessage>,
    #[serde(default)]
    total_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ZepErrorResponse {
    #[serde(default)]
    message: Option<String>,
}

// ============================================================================
// ZepClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct ZepClient {
    client: Client,
    base_url: String,
    api_key: String,
    max_retries: usize,
    retry_delay_ms: u64,
}

impl ZepClient {
    /// Build a client. The API key comes from `config.api_key`, falling back
    /// to the environment variable named by `config.api_key_env`.
    pub fn new(config: &ZepConfig) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| MemoryError::MissingApiKey {
                env_var: config.api_key_env.clone(),
            })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Api-Key {}", self.api_key))
    }

    /// Send an idempotent request, retrying transient failures.
    async fn read<T, F>(&self, entity: EntityKind, id: &str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let retry_strategy = ExponentialBackoff::from_millis(self.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries);

        let build = &build;
        RetryIf::spawn(
            retry_strategy,
            move || async move {
                let response = build().send().await?;
                decode(response, entity, id).await
            },
            |e: &MemoryError| {
                let retry = e.is_transient();
                if retry {
                    tracing::warn!(error = %e, "Transient Zep error, retrying");
                }
                retry
            },
        )
        .await
    }

    async fn message_page(&self, path: &str, session_id: &str, page: usize) -> Result<MessageListResponse> {
        let page_size = MESSAGE_PAGE_SIZE.to_string();
        let cursor = page.to_string();
        self.read(EntityKind::Session, session_id, || {
            self.request(reqwest::Method::GET, path).query(&[
                ("limit", page_size.as_str()),
                ("cursor", cursor.as_str()),
            ])
        })
        .await
    }

    /// Forward walk for responses that carry no `total_count`.
    async fn remaining_pages(
        &self,
        path: &str,
        session_id: &str,
        mut all: Vec<ExternalMessage>,
    ) -> Result<Vec<ExternalMessage>> {
        let mut fetched = all.len();
        let mut page = 1;
        while fetched >= MESSAGE_PAGE_SIZE {
            page += 1;
            let next = self.message_page(path, session_id, page).await?;
            fetched = next.messages.len();
            all.extend(next.messages);
        }
        Ok(all)
    }

    /// Send a non-idempotent request exactly once.
    async fn write(&self, entity: EntityKind, id: &str, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        check_status(response, entity, id).await
    }
}

async fn check_status(response: Response, entity: EntityKind, id: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ZepErrorResponse>(&error_body)
        .ok()
        .and_then(|e| e.message)
        .unwrap_or(error_body);

    match status {
        StatusCode::NOT_FOUND => Err(MemoryError::NotFound {
            entity,
            id: id.to_string(),
        }),
        StatusCode::CONFLICT => Err(MemoryError::Conflict {
            entity,
            id: id.to_string(),
        }),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Err(MemoryError::Validation(message)),
        _ => {
            tracing::error!(code = status.as_u16(), message = %message, "Zep API error");
            Err(MemoryError::Api {
                code: status.as_u16(),
                message,
            })
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response, entity: EntityKind, id: &str) -> Result<T> {
    let response = check_status(response, entity, id).await?;
    Ok(response.json::<T>().await?)
}

/// Whether a chronological suffix of the history already holds the whole
/// `limit`/`before` window.
fn window_covered(tail: &[ExternalMessage], limit: usize, before: Option<&str>) -> bool {
    match before {
        None => tail.len() >= limit,
        Some(cursor) => tail
            .iter()
            .position(|m| m.uuid.as_deref() == Some(cursor))
            .is_some_and(|pos| pos >= limit),
    }
}

/// Apply the `limit`/`before` window to a chronological message list.
fn window(mut messages: Vec<ExternalMessage>, limit: usize, before: Option<&str>) -> Vec<ExternalMessage> {
    let end = match before {
        Some(cursor) => match messages.iter().position(|m| m.uuid.as_deref() == Some(cursor)) {
            Some(pos) => pos,
            None => return Vec::new(),
        },
        None => messages.len(),
    };
    messages.truncate(end);
    messages.split_off(end.saturating_sub(limit))
}

#[async_trait]
impl MemoryClient for ZepClient {
    async fn create_user(&self, user: &ExternalUser) -> Result<ExternalUser> {
        let response = self
            .write(
                EntityKind::User,
                &user.user_id,
                self.request(reqwest::Method::POST, "/users").json(user),
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn get_user(&self, user_id: &str) -> Result<ExternalUser> {
        let path = format!("/users/{user_id}");
        self.read(EntityKind::User, user_id, || {
            self.request(reqwest::Method::GET, &path)
        })
        .await
    }

    async fn update_user(&self, user_id: &str, update: &UserUpdate) -> Result<ExternalUser> {
        let path = format!("/users/{user_id}");
        let response = self
            .write(
                EntityKind::User,
                user_id,
                self.request(reqwest::Method::PATCH, &path).json(update),
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        let path = format!("/users/{user_id}");
        self.write(EntityKind::User, user_id, self.request(reqwest::Method::DELETE, &path))
            .await?;
        Ok(())
    }

    async fn create_session(&self, user_id: &str, metadata: Metadata) -> Result<ExternalSession> {
        let body = CreateSessionRequest {
            session_id: Uuid::new_v4().to_string(),
            user_id,
            metadata,
        };
        // A 404 here means the owning user is missing.
        let response = self
            .write(
                EntityKind::Session,
                &body.session_id,
                self.request(reqwest::Method::POST, "/sessions").json(&body),
            )
            .await
            .map_err(|e| match e {
                MemoryError::NotFound { .. } => MemoryError::user_not_found(user_id),
                other => other,
            })?;
        Ok(response.json().await?)
    }

    async fn get_session(&self, session_id: &str) -> Result<ExternalSession> {
        let path = format!("/sessions/{session_id}");
        self.read(EntityKind::Session, session_id, || {
            self.request(reqwest::Method::GET, &path)
        })
        .await
    }

    async fn list_sessions(&self, user_id: &str, limit: usize, offset: usize) -> Result<Vec<ExternalSession>> {
        let path = format!("/users/{user_id}/sessions");
        let mut sessions: Vec<ExternalSession> = self
            .read(EntityKind::User, user_id, || {
                self.request(reqwest::Method::GET, &path)
            })
            .await?;

        // RFC 3339 timestamps from one service sort lexically.
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    async fn search_sessions(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<ExternalSession>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let body = SearchRequest {
            text: query,
            user_id,
            search_scope: "messages",
        };
        let fetch_limit = limit.saturating_mul(4).to_string();
        let response: SearchResponse = self
            .read(EntityKind::User, user_id, || {
                self.request(reqwest::Method::POST, "/sessions/search")
                    .query(&[("limit", fetch_limit.as_str())])
                    .json(&body)
            })
            .await?;

        let mut session_ids: Vec<String> = Vec::new();
        for hit in response.results {
            if let Some(id) = hit.session_id {
                if !session_ids.contains(&id) {
                    session_ids.push(id);
                }
            }
            if session_ids.len() == limit {
                break;
            }
        }

        let sessions = try_join_all(session_ids.iter().map(|id| async move {
            match self.get_session(id).await {
                Ok(s) => Ok(Some(s)),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(session_id = %id, "Search hit for a deleted session, skipping");
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        }))
        .await?;

        Ok(sessions.into_iter().flatten().collect())
    }

    async fn update_session_metadata(&self, session_id: &str, metadata: Metadata) -> Result<()> {
        let path = format!("/sessions/{session_id}");
        self.write(
            EntityKind::Session,
            session_id,
            self.request(reqwest::Method::PATCH, &path)
                .json(&UpdateSessionRequest { metadata }),
        )
        .await?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let path = format!("/sessions/{session_id}/memory");
        self.write(
            EntityKind::Session,
            session_id,
            self.request(reqwest::Method::DELETE, &path),
        )
        .await?;
        Ok(())
    }

    async fn append_messages(&self, session_id: &str, messages: &[ExternalMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let path = format!("/sessions/{session_id}/memory");
        self.write(
            EntityKind::Session,
            session_id,
            self.request(reqwest::Method::POST, &path)
                .json(&AddMemoryRequest { messages }),
        )
        .await?;
        tracing::debug!(session_id = %session_id, count = messages.len(), "Appended messages to Zep");
        Ok(())
    }

    async fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<ExternalMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let path = format!("/sessions/{session_id}/messages");
        let first = self.message_page(&path, session_id, 1).await?;

        let Some(total) = first.total_count else {
            let all = self.remaining_pages(&path, session_id, first.messages).await?;
            return Ok(window(all, limit, before));
        };

        // Walk backwards from the last page until the window is covered.
        let mut first_page = Some(first.messages);
        let mut page = total.div_ceil(MESSAGE_PAGE_SIZE).max(1);
        let mut tail: Vec<ExternalMessage> = Vec::new();
        loop {
            let mut messages = if page == 1 {
                first_page.take().unwrap_or_default()
            } else {
                self.message_page(&path, session_id, page).await?.messages
            };
            messages.append(&mut tail);
            tail = messages;

            if page == 1 || window_covered(&tail, limit, before) {
                break;
            }
            page -= 1;
        }
        tracing::debug!(session_id = %session_id, total, fetched = tail.len(), "Listed session messages");

        Ok(window(tail, limit, before))
    }

    fn name(&self) -> &str {
        "zep"
    }
}

// ============================================================================
// TESTS
// ============================================================================
