//! Package-level constants.

/// Current version of tabrun (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const NAME: &str = "tabrun";

/// Conversation id used when nothing more specific can be resolved.
pub const DEFAULT_CONVERSATION_ID: &str = "default";

/// Prefix of conversation ids derived from a document id.
pub const DOCUMENT_CONVERSATION_PREFIX: &str = "doc-";

/// Message attached to the `paused` event when a user cancels a run.
pub const PAUSED_MESSAGE: &str = "Task paused. Send a new message to resume.";
