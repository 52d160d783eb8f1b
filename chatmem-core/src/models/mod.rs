pub mod message;
pub mod metadata;
pub mod session;
pub mod user;

pub use message::{Message, SessionEntry, ToolCall};
pub use metadata::{ManagedMetadata, Metadata, APPLICATION_NAMESPACE, TOOL_NAMESPACE};
pub use session::{FlushReport, Session};
pub use user::{validate_identity, User};
