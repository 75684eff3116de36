//! Error taxonomy for the orchestration core.
//!
//! Admission and target-resolution failures surface synchronously to the
//! caller of `Conversation::run` and are never retried. Cancellation is
//! reported as an outcome, not an error; [`CoreError::UserCancelled`] only
//! exists so runners can propagate a cancellation with `?`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ConversationId, DocumentId};

/// Resource pool guarded by admission control.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pool {
    /// Open documents.
    Documents,
    /// In-flight runs.
    Executions,
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Documents => f.write_str("documents"),
            Self::Executions => f.write_str("executions"),
        }
    }
}

/// Errors raised by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A resource cap was already reached.
    #[error("admission denied: {pool} at capacity ({cap})")]
    AdmissionDenied {
        /// Pool that refused admission.
        pool: Pool,
        /// Configured cap of that pool.
        cap: usize,
    },

    /// The document a conversation was bound to no longer exists.
    #[error("lost document context: {conversation_id} was bound to closed document {document_id}")]
    LostDocumentContext {
        /// Conversation whose binding became invalid.
        conversation_id: ConversationId,
        /// The vanished document.
        document_id: DocumentId,
    },

    /// No document could be resolved for the run.
    #[error("no target document available")]
    NoTargetDocument,

    /// The run was cancelled cooperatively.
    #[error("cancelled by user")]
    UserCancelled,

    /// The agent runner failed.
    #[error("runner failure: {0}")]
    RunnerFailure(String),

    /// One subscriber callback failed while a channel event was delivered.
    #[error("delivery failure on channel {channel}: {reason}")]
    ChannelDeliveryFailure {
        /// Channel (conversation id) being published to.
        channel: ConversationId,
        /// What the subscriber reported.
        reason: String,
    },

    /// Run options failed validation at the boundary.
    #[error("invalid run options: {0}")]
    InvalidOptions(String),

    /// The document host could not provide a handle.
    #[error("document {document_id} unavailable: {reason}")]
    DocumentUnavailable {
        /// Requested document.
        document_id: DocumentId,
        /// Host-reported reason.
        reason: String,
    },

    /// The conversation was disposed and cannot run again.
    #[error("conversation {0} is disposed")]
    Disposed(ConversationId),
}

impl CoreError {
    /// Wrap any collaborator error as a [`CoreError::RunnerFailure`].
    pub fn runner(err: impl fmt::Display) -> Self {
        Self::RunnerFailure(err.to_string())
    }

    /// Whether the conversation can simply be run again.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AdmissionDenied { .. }
            | Self::UserCancelled
            | Self::RunnerFailure(_)
            | Self::ChannelDeliveryFailure { .. }
            | Self::DocumentUnavailable { .. }
            | Self::NoTargetDocument => true,
            Self::LostDocumentContext { .. } | Self::InvalidOptions(_) | Self::Disposed(_) => {
                false
            }
        }
    }

    /// Error category string for event emission.
    pub fn category(&self) -> &'static str {
        match self {
            Self::AdmissionDenied { .. } => "admission_denied",
            Self::LostDocumentContext { .. } => "lost_document_context",
            Self::NoTargetDocument => "no_target_document",
            Self::UserCancelled => "user_cancelled",
            Self::RunnerFailure(_) => "runner_failure",
            Self::ChannelDeliveryFailure { .. } => "channel_delivery_failure",
            Self::InvalidOptions(_) => "invalid_options",
            Self::DocumentUnavailable { .. } => "document_unavailable",
            Self::Disposed(_) => "disposed",
        }
    }
}
