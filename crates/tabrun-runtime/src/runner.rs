//! The agent runner seam and the per-run context handed to it.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tabrun_core::events::{ChannelEvent, event_types};
use tabrun_core::{ConversationId, CoreError, DocumentId, RunId};
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::document::{DocumentContext, DocumentHandle};
use crate::options::{ConversationOptions, RunMetadata};

/// Executes one run of a conversation.
///
/// The core never interprets `query`. Implementations must observe
/// cancellation through [`RunContext::checkpoint`] or
/// [`RunContext::cancelled`] at every suspension point; nothing preempts them.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run `query` to a terminal outcome.
    async fn run(
        &self,
        query: &str,
        metadata: &RunMetadata,
        ctx: RunContext,
    ) -> Result<Value, CoreError>;
}

/// Conversation history that survives across runs until reset or dispose.
#[derive(Clone, Debug, Default)]
pub struct ConversationBuffer {
    entries: Arc<Mutex<Vec<Value>>>,
}

impl ConversationBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry.
    pub fn push(&self, entry: Value) {
        self.entries.lock().push(entry);
    }

    /// Copy of all entries.
    pub fn snapshot(&self) -> Vec<Value> {
        self.entries.lock().clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Everything one run may touch. Built fresh for every run; only the
/// buffer is shared with earlier runs.
#[derive(Clone)]
pub struct RunContext {
    run_id: RunId,
    generation: u64,
    conversation_id: ConversationId,
    cancel: CancellationToken,
    buffer: ConversationBuffer,
    channel: Arc<Channel>,
    target_document: DocumentId,
    handle: Arc<dyn DocumentHandle>,
    options: ConversationOptions,
    documents: Arc<DocumentContext>,
}

/// Parts assembled by the run controller.
pub(crate) struct RunParts {
    pub(crate) run_id: RunId,
    pub(crate) generation: u64,
    pub(crate) conversation_id: ConversationId,
    pub(crate) cancel: CancellationToken,
    pub(crate) buffer: ConversationBuffer,
    pub(crate) channel: Arc<Channel>,
    pub(crate) target_document: DocumentId,
    pub(crate) handle: Arc<dyn DocumentHandle>,
    pub(crate) options: ConversationOptions,
    pub(crate) documents: Arc<DocumentContext>,
}

impl RunContext {
    pub(crate) fn new(parts: RunParts) -> Self {
        Self {
            run_id: parts.run_id,
            generation: parts.generation,
            conversation_id: parts.conversation_id,
            cancel: parts.cancel,
            buffer: parts.buffer,
            channel: parts.channel,
            target_document: parts.target_document,
            handle: parts.handle,
            options: parts.options,
            documents: parts.documents,
        }
    }

    /// Id of this run.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Generation this run was started under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Owning conversation.
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// The document this run is locked to.
    pub fn target_document(&self) -> DocumentId {
        self.target_document
    }

    /// Handle of the target document.
    pub fn handle(&self) -> &Arc<dyn DocumentHandle> {
        &self.handle
    }

    /// Conversation history.
    pub fn buffer(&self) -> &ConversationBuffer {
        &self.buffer
    }

    /// The conversation's channel.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Options in effect for this run.
    pub fn options(&self) -> &ConversationOptions {
        &self.options
    }

    /// Cancellation token of this run, for `select!` or child tokens.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// `Err(UserCancelled)` once the run is cancelled.
    pub fn checkpoint(&self) -> Result<(), CoreError> {
        if self.cancel.is_cancelled() {
            Err(CoreError::UserCancelled)
        } else {
            Ok(())
        }
    }

    /// Publish an application event on the conversation channel.
    pub fn publish(&self, event_type: &str, data: Value) -> usize {
        let event = ChannelEvent::new(event_type, self.conversation_id.clone())
            .with_run(self.run_id.clone())
            .with_data(data);
        self.channel.publish(&event)
    }

    /// Publish a `run.progress` event.
    pub fn progress(&self, data: Value) -> usize {
        self.publish(event_types::PROGRESS, data)
    }

    /// Confirm the run still owns a live target document.
    ///
    /// Fails with [`CoreError::LostDocumentContext`] once the document was
    /// closed or the lock was invalidated.
    pub async fn verify_document(&self) -> Result<DocumentId, CoreError> {
        let locked =
            self.documents.locked_document(&self.conversation_id) == Some(self.target_document);
        if locked && self.documents.host().exists(self.target_document).await {
            return Ok(self.target_document);
        }
        Err(CoreError::LostDocumentContext {
            conversation_id: self.conversation_id.clone(),
            document_id: self.target_document,
        })
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("generation", &self.generation)
            .field("conversation_id", &self.conversation_id)
            .field("target_document", &self.target_document)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelBus;
    use crate::resource_monitor::ResourceMonitor;
    use crate::testing::MemoryHost;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tabrun_settings::{DocumentCacheSettings, ResourceSettings};

    async fn context(host: &Arc<MemoryHost>) -> (RunContext, Arc<DocumentContext>) {
        let documents = Arc::new(DocumentContext::new(
            host.clone(),
            Arc::new(ResourceMonitor::new(ResourceSettings::default())),
            DocumentCacheSettings::default(),
        ));
        let conversation_id = ConversationId::from("x");
        let doc = DocumentId::new(1);
        let handle = documents.get_or_create(doc).await.unwrap();
        documents.lock_conversation_to_document(doc, &conversation_id);
        let bus = ChannelBus::new();
        let ctx = RunContext::new(RunParts {
            run_id: RunId::from("r1"),
            generation: 1,
            conversation_id: conversation_id.clone(),
            cancel: CancellationToken::new(),
            buffer: ConversationBuffer::new(),
            channel: bus.get_channel(&conversation_id),
            target_document: doc,
            handle,
            options: ConversationOptions::default(),
            documents: documents.clone(),
        });
        (ctx, documents)
    }

    #[test]
    fn buffer_is_shared_between_clones() {
        let buffer = ConversationBuffer::new();
        let other = buffer.clone();
        buffer.push(json!("hello"));
        assert_eq!(other.len(), 1);
        other.clear();
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn checkpoint_reports_cancellation() {
        let host = Arc::new(MemoryHost::with_documents([1]));
        let (ctx, _) = context(&host).await;
        assert!(ctx.checkpoint().is_ok());
        ctx.cancellation_token().cancel();
        assert!(ctx.is_cancelled());
        assert_matches!(ctx.checkpoint(), Err(CoreError::UserCancelled));
        ctx.cancelled().await;
    }

    #[tokio::test]
    async fn progress_is_tagged_with_run() {
        let host = Arc::new(MemoryHost::with_documents([1]));
        let (ctx, _) = context(&host).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = ctx.channel().subscribe(move |e| {
            sink.lock().push(e.clone());
            Ok(())
        });
        assert_eq!(ctx.progress(json!({"step": 1})), 1);
        let events = seen.lock();
        assert_eq!(events[0].event_type, event_types::PROGRESS);
        assert_eq!(events[0].run_id.as_ref().map(RunId::as_str), Some("r1"));
    }

    #[tokio::test]
    async fn verify_document_detects_closed_document() {
        let host = Arc::new(MemoryHost::with_documents([1]));
        let (ctx, documents) = context(&host).await;
        assert_eq!(ctx.verify_document().await.unwrap(), DocumentId::new(1));

        host.close(DocumentId::new(1));
        let _ = documents.close_document(DocumentId::new(1)).await;
        assert_matches!(ctx.verify_document().await, Err(CoreError::LostDocumentContext { .. }));
    }
}
