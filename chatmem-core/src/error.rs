use std::fmt;

use thiserror::Error;

/// Which kind of remote record an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    User,
    Session,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::User => f.write_str("user"),
            EntityKind::Session => f.write_str("session"),
        }
    }
}

/// An external record the format adapter could not translate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed external message at index {index}: {reason}")]
pub struct FormatError {
    pub index: usize,
    pub reason: String,
}

impl FormatError {
    pub fn new(index: usize, reason: impl Into<String>) -> Self {
        Self {
            index,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityKind, id: String },

    #[error("{entity} already exists: {id}")]
    Conflict { entity: EntityKind, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Format(#[from] FormatError),

    /// Pending entries reached the remote store but a later stage of the
    /// flush failed. Only the remainder needs retrying.
    #[error("Flush partially applied ({entries_written} entries written): {source}")]
    PartialFlush {
        entries_written: usize,
        #[source]
        source: Box<MemoryError>,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Missing API key (set it in config or via ${env_var})")]
    MissingApiKey { env_var: String },

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl MemoryError {
    pub fn user_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: EntityKind::User,
            id: id.into(),
        }
    }

    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: EntityKind::Session,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Transport failures and throttling/server-side statuses worth another
    /// attempt on idempotent reads.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
