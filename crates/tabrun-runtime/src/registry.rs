//! Keyed store of conversations with lifecycle fan-out.

use std::sync::Arc;

use dashmap::DashMap;
use tabrun_core::ConversationId;
use tracing::{debug, info, instrument};

use crate::conversation::{Conversation, ConversationDeps, ConversationStatus};

/// All live conversations, one per id.
pub struct ConversationRegistry {
    deps: ConversationDeps,
    conversations: DashMap<ConversationId, Arc<Conversation>>,
}

impl ConversationRegistry {
    /// Create an empty registry whose conversations share `deps`.
    pub fn new(deps: ConversationDeps) -> Self {
        Self {
            deps,
            conversations: DashMap::new(),
        }
    }

    /// Shared collaborators.
    pub fn deps(&self) -> &ConversationDeps {
        &self.deps
    }

    /// The conversation for `id`, created on first reference.
    pub fn get_or_create(&self, id: &ConversationId) -> Arc<Conversation> {
        self.conversations
            .entry(id.clone())
            .or_insert_with(|| {
                debug!(conversation_id = %id, "conversation created");
                Arc::new(Conversation::new(id.clone(), self.deps.clone()))
            })
            .value()
            .clone()
    }

    /// Whether `id` is live.
    pub fn has(&self, id: &ConversationId) -> bool {
        self.conversations.contains_key(id)
    }

    /// The conversation for `id`, if live.
    pub fn get(&self, id: &ConversationId) -> Option<Arc<Conversation>> {
        self.conversations.get(id).map(|c| Arc::clone(c.value()))
    }

    fn snapshot(&self) -> Vec<Arc<Conversation>> {
        self.conversations.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// Cancel the run of `id`. `false` for unknown ids or idle conversations.
    pub fn cancel(&self, id: &ConversationId) -> bool {
        self.get(id).is_some_and(|c| c.cancel())
    }

    /// Cancel every in-flight run. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        self.snapshot().iter().filter(|c| c.cancel()).count()
    }

    /// Reset `id`. `false` for unknown ids.
    pub fn reset(&self, id: &ConversationId) -> bool {
        match self.get(id) {
            Some(conversation) => {
                let _ = conversation.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every conversation. Returns how many were reset.
    pub fn reset_all(&self) -> usize {
        let conversations = self.snapshot();
        for conversation in &conversations {
            let _ = conversation.reset();
        }
        conversations.len()
    }

    /// Dispose `id`, force-delete its channel and drop it from the registry.
    ///
    /// The entry is removed before teardown starts, so the id is free for a
    /// fresh conversation whatever happens next. `false` for unknown ids.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn dispose(&self, id: &ConversationId) -> bool {
        let Some((_, conversation)) = self.conversations.remove(id) else {
            return false;
        };
        conversation.dispose();
        let _ = self.deps.bus.delete_channel(id, true);
        info!(remaining = self.conversations.len(), "conversation removed");
        true
    }

    /// Dispose every conversation. Returns how many were disposed.
    pub fn dispose_all(&self) -> usize {
        self.list_ids().iter().filter(|id| self.dispose(id)).count()
    }

    /// Ids of live conversations, sorted.
    pub fn list_ids(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.conversations.iter().map(|c| c.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Status of `id`, if live.
    pub fn status(&self, id: &ConversationId) -> Option<ConversationStatus> {
        self.get(id).map(|c| c.status())
    }

    /// Status of every live conversation, sorted by id.
    pub fn statuses(&self) -> Vec<ConversationStatus> {
        let mut statuses: Vec<_> = self.snapshot().iter().map(|c| c.status()).collect();
        statuses.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        statuses
    }

    /// Number of live conversations.
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether no conversation is live.
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelBus;
    use crate::conversation::RunOutcome;
    use crate::document::DocumentContext;
    use crate::options::RunMetadata;
    use crate::resource_monitor::ResourceMonitor;
    use crate::testing::{MemoryHost, ScriptedRunner, Step};
    use assert_matches::assert_matches;
    use tabrun_core::DocumentId;
    use tabrun_settings::{DocumentCacheSettings, ResourceSettings};

    fn registry(
        steps: impl IntoIterator<Item = Step>,
    ) -> (Arc<ConversationRegistry>, Arc<ScriptedRunner>) {
        let host = Arc::new(MemoryHost::with_documents([1]));
        host.focus(DocumentId::new(1));
        let monitor = Arc::new(ResourceMonitor::new(ResourceSettings::default()));
        let runner = Arc::new(ScriptedRunner::with_script(steps));
        let deps = ConversationDeps {
            documents: Arc::new(DocumentContext::new(
                host,
                monitor.clone(),
                DocumentCacheSettings::default(),
            )),
            monitor,
            bus: Arc::new(ChannelBus::new()),
            runner: runner.clone(),
        };
        (Arc::new(ConversationRegistry::new(deps)), runner)
    }

    fn conv(id: &str) -> ConversationId {
        ConversationId::from(id)
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let (registry, _) = registry([]);
        let a = registry.get_or_create(&conv("x"));
        let b = registry.get_or_create(&conv("x"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.has(&conv("x")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_or_create_yields_one_conversation() {
        let (registry, _) = registry([]);
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create(&conv("x")) })
            })
            .collect();
        let mut created = Vec::new();
        for task in tasks {
            created.push(task.await.unwrap());
        }
        assert!(created.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn unknown_ids_are_noops() {
        let (registry, _) = registry([]);
        assert!(!registry.cancel(&conv("nope")));
        assert!(!registry.reset(&conv("nope")));
        assert!(!registry.dispose(&conv("nope")));
        assert!(registry.status(&conv("nope")).is_none());
    }

    #[tokio::test]
    async fn dispose_removes_conversation_and_channel() {
        let (registry, runner) = registry([Step::WaitForCancel]);
        let conversation = registry.get_or_create(&conv("x"));
        let channel = registry.deps().bus.get_channel(&conv("x"));
        let _sub = channel.subscribe(|_| Ok(()));

        let task = {
            let conversation = conversation.clone();
            tokio::spawn(async move { conversation.run("q", &RunMetadata::default()).await })
        };
        runner.wait_started(1).await;

        assert!(registry.dispose(&conv("x")));
        assert!(!registry.has(&conv("x")));
        assert!(!registry.deps().bus.has_channel(&conv("x")));
        assert!(conversation.is_disposed());
        assert_matches!(task.await.unwrap(), Ok(RunOutcome::Disposed));

        let fresh = registry.get_or_create(&conv("x"));
        assert!(!Arc::ptr_eq(&conversation, &fresh));
        assert!(!fresh.is_disposed());
    }

    #[tokio::test]
    async fn fan_out_over_all_conversations() {
        let (registry, runner) = registry([Step::WaitForCancel]);
        let busy = registry.get_or_create(&conv("busy"));
        let _idle = registry.get_or_create(&conv("idle"));
        let task = tokio::spawn(async move { busy.run("q", &RunMetadata::default()).await });
        runner.wait_started(1).await;

        assert_eq!(registry.cancel_all(), 1);
        assert_matches!(task.await.unwrap(), Ok(RunOutcome::Paused));
        assert_eq!(registry.reset_all(), 2);
        assert_eq!(registry.list_ids(), vec![conv("busy"), conv("idle")]);
        assert_eq!(registry.statuses().len(), 2);

        assert_eq!(registry.dispose_all(), 2);
        assert!(registry.is_empty());
    }
}
