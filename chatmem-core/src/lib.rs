pub mod adapter;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod zep_client;

pub use adapter::{FormatAdapter, MetadataEnvelope, ZepAdapter};
pub use client::{ExternalMessage, ExternalSession, ExternalUser, MemoryClient, UserUpdate};
pub use config::{ChatmemConfig, ZepConfig};
pub use error::{EntityKind, FormatError, MemoryError};
pub use models::{
    FlushReport, ManagedMetadata, Message, Metadata, Session, SessionEntry, ToolCall, User,
};
pub use repository::SessionRepo;
pub use zep_client::ZepClient;
