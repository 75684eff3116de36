//! Channel events and observer notifications.
//!
//! Events are application-defined: the core only produces the lifecycle
//! events listed in [`event_types`], runners publish anything else
//! (progress, partial results, human-input requests) under their own types.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::CoreError;
use crate::ids::{ConversationId, DocumentId, RunId};

/// Event types emitted by the core itself.
pub mod event_types {
    /// A run acquired its document and started.
    pub const RUN_STARTED: &str = "run.started";
    /// Free-form progress published by a runner.
    pub const PROGRESS: &str = "run.progress";
    /// A run finished successfully.
    pub const COMPLETED: &str = "run.completed";
    /// A run was cancelled by the user; the conversation can resume.
    pub const PAUSED: &str = "run.paused";
    /// A run failed.
    pub const ERROR: &str = "run.error";
    /// Observer binding changed.
    pub const CONTEXT_CHANGED: &str = "context.changed";
    /// Observer binding was cleared.
    pub const CONTEXT_CLEARED: &str = "context.cleared";
}

/// One event published on a conversation channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEvent {
    /// Event type (e.g. `run.progress`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Conversation the event belongs to.
    pub conversation_id: ConversationId,
    /// Run that produced the event, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// RFC 3339 timestamp with millisecond precision.
    pub timestamp: String,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ChannelEvent {
    /// Create an event stamped with the current time.
    pub fn new(event_type: impl Into<String>, conversation_id: ConversationId) -> Self {
        Self {
            event_type: event_type.into(),
            conversation_id,
            run_id: None,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data: None,
        }
    }

    /// Attach the producing run.
    #[must_use]
    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `run.started` for the given target document.
    pub fn run_started(
        conversation_id: ConversationId,
        run_id: RunId,
        document_id: DocumentId,
    ) -> Self {
        Self::new(event_types::RUN_STARTED, conversation_id)
            .with_run(run_id)
            .with_data(json!({ "documentId": document_id }))
    }

    /// `run.completed` carrying the runner's result.
    pub fn completed(conversation_id: ConversationId, run_id: RunId, result: Value) -> Self {
        Self::new(event_types::COMPLETED, conversation_id)
            .with_run(run_id)
            .with_data(json!({ "result": result }))
    }

    /// `run.paused`: cancellation, explicitly resumable.
    pub fn paused(conversation_id: ConversationId, run_id: Option<RunId>, message: &str) -> Self {
        let mut event = Self::new(event_types::PAUSED, conversation_id)
            .with_data(json!({ "message": message, "resumable": true }));
        event.run_id = run_id;
        event
    }

    /// `run.error` describing a terminal failure.
    pub fn error(conversation_id: ConversationId, run_id: RunId, err: &CoreError) -> Self {
        Self::new(event_types::ERROR, conversation_id)
            .with_run(run_id)
            .with_data(json!({
                "message": err.to_string(),
                "category": err.category(),
                "recoverable": err.is_recoverable(),
            }))
    }

    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            event_types::COMPLETED | event_types::PAUSED | event_types::ERROR
        )
    }
}

/// Tells an observer which conversation it now follows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextNotification {
    /// Conversation now bound, `None` when the binding was cleared.
    pub conversation_id: Option<ConversationId>,
    /// Document the observer is associated with.
    pub document_id: Option<DocumentId>,
}

impl ContextNotification {
    /// Wire type of this notification.
    pub fn event_type(&self) -> &'static str {
        if self.conversation_id.is_some() {
            event_types::CONTEXT_CHANGED
        } else {
            event_types::CONTEXT_CLEARED
        }
    }

    /// JSON envelope sent to observer connections.
    pub fn to_message(&self) -> Value {
        json!({
            "type": self.event_type(),
            "conversationId": self.conversation_id,
            "documentId": self.document_id,
        })
    }
}
