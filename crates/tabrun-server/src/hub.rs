//! Browser lifecycle signals on top of the orchestrator.
//!
//! The [`Hub`] is what an embedding shell talks to: triggers go through
//! [`Hub::handle`], tab/window events through [`Hub::document_closed`] and
//! [`Hub::focus_changed`], and observer pages through [`Hub::connect`].

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tabrun_core::logging::{LogFormat, init_subscriber};
use tabrun_core::{ConversationId, CoreError, DocumentId, constants};
use tabrun_runtime::{AgentRunner, DocumentHost, Intent, IntentResponse, Orchestrator};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::connection::ObserverConnection;
use crate::router::ConnectionRouter;

/// Orchestrator plus observer routing.
pub struct Hub {
    orchestrator: Arc<Orchestrator>,
    router: Arc<ConnectionRouter>,
}

impl Hub {
    /// Attach a router to `orchestrator`'s channel bus.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let router = Arc::new(ConnectionRouter::new(orchestrator.bus().clone()));
        Self { orchestrator, router }
    }

    /// The orchestration core.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Observer routing.
    pub fn router(&self) -> &Arc<ConnectionRouter> {
        &self.router
    }

    /// Open an observer connection for `identity` and register it.
    pub async fn connect(
        &self,
        identity: &str,
    ) -> (Arc<ObserverConnection>, mpsc::Receiver<Arc<String>>) {
        let capacity = self.orchestrator.settings().router.send_buffer;
        let (connection, rx) = ObserverConnection::channel(identity, capacity);
        let _ = self.router.register_connection(connection.clone()).await;
        (connection, rx)
    }

    /// Close and unregister an observer connection.
    pub async fn disconnect(&self, connection: &ObserverConnection) -> bool {
        let _ = connection.disconnect();
        self.router.unregister_connection(&connection.id).await
    }

    /// Dispatch a trigger.
    ///
    /// A start naming a target document first moves that document's
    /// observers onto the resolved conversation, so they see the run. If the
    /// run is rejected before it begins they are moved back. Observers of a
    /// disposed conversation are resubscribed to its fresh channel.
    pub async fn handle(&self, intent: Intent) -> Result<IntentResponse, CoreError> {
        let mut document_move = None;
        if let Intent::Start {
            conversation_id,
            options: Some(options),
            metadata,
            ..
        } = &intent
        {
            options.validate()?;
            if let Some(document_id) = options.primary_document() {
                let id = self.orchestrator.resolve_conversation_id(
                    conversation_id.as_deref(),
                    metadata,
                    Some(options),
                );
                let moved = self.router.assign_document(document_id, &id).await;
                debug!(
                    conversation_id = %id,
                    document_id = %document_id,
                    moved = moved.len(),
                    "observers follow run"
                );
                document_move = Some(moved);
            }
        }
        let disposing = matches!(intent, Intent::Dispose { .. });

        let result = self.orchestrator.handle(intent).await;
        match &result {
            Err(error) => {
                if let Some(moved) = document_move {
                    debug!(%error, "run rejected, observers return");
                    self.router.revert_assignment(moved).await;
                }
            }
            Ok(IntentResponse::Affected { conversation_ids }) if disposing => {
                let _ = self.refresh_observers(conversation_ids).await;
            }
            Ok(_) => {}
        }
        result
    }

    async fn refresh_observers(&self, disposed: &[ConversationId]) -> usize {
        let mut refreshed = 0;
        for id in disposed {
            refreshed += self.router.refresh_conversation(id).await;
        }
        refreshed
    }

    /// A document closed: dispose the conversations bound to it, drop it
    /// from the cache and disconnect its observers. Observers elsewhere that
    /// follow a disposed conversation stay attached to its id. Returns the
    /// disposed conversation ids.
    #[instrument(skip(self), fields(document_id = %document_id))]
    pub async fn document_closed(&self, document_id: DocumentId) -> Vec<ConversationId> {
        let disposed = match self
            .orchestrator
            .handle(Intent::Dispose {
                conversation_id: None,
                document_id: Some(document_id),
            })
            .await
        {
            Ok(IntentResponse::Affected { conversation_ids }) => conversation_ids,
            _ => Vec::new(),
        };
        let evicted = self.orchestrator.documents().close_document(document_id).await;
        let disconnected = self.router.cleanup_for_document(document_id).await;
        let refreshed = self.refresh_observers(&disposed).await;
        info!(
            disposed = disposed.len(),
            evicted,
            disconnected,
            refreshed,
            "document closed"
        );
        disposed
    }

    /// Focus in `group_id` moved to `document_id`: tell that group's
    /// observers which conversation, if any, now owns the view.
    ///
    /// The owner is the router's assignment, else the lock holder, else the
    /// document's derived conversation if it is live.
    pub async fn focus_changed(&self, group_id: &str, document_id: DocumentId) -> usize {
        let conversation_id = match self.router.conversation_for_document(document_id).await {
            Some(id) => Some(id),
            None => self.orchestrator.documents().lock_holder(document_id).or_else(|| {
                let derived = ConversationId::for_document(document_id);
                self.orchestrator.registry().has(&derived).then_some(derived)
            }),
        };
        self.router
            .broadcast_to_document_group(group_id, document_id, conversation_id)
            .await
    }

    /// Disconnect every observer and shut the orchestrator down.
    pub async fn shutdown(&self) {
        let disconnected = self.router.disconnect_all().await;
        self.orchestrator.shutdown().await;
        info!(disconnected, "hub stopped");
    }
}

/// Load settings from `settings_path`, install the log subscriber and start
/// the orchestrator with its background loops. Must be called inside a tokio
/// runtime.
pub fn bootstrap(
    settings_path: &Path,
    host: Arc<dyn DocumentHost>,
    runner: Arc<dyn AgentRunner>,
) -> anyhow::Result<Hub> {
    let settings = tabrun_settings::load_settings_from_path(settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    init_subscriber(&settings.logging.level, LogFormat::parse(&settings.logging.format));
    info!(
        package = constants::NAME,
        version = constants::VERSION,
        settings = %settings_path.display(),
        "starting"
    );
    let orchestrator = Arc::new(Orchestrator::start(settings, host, runner));
    Ok(Hub::new(orchestrator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::Value;
    use tabrun_runtime::RunOptions;
    use tabrun_runtime::testing::{MemoryHost, ScriptedRunner, Step};
    use tabrun_settings::TabrunSettings;

    fn hub(
        steps: impl IntoIterator<Item = Step>,
    ) -> (Hub, Arc<MemoryHost>, Arc<ScriptedRunner>) {
        let host = Arc::new(MemoryHost::with_documents([1, 2, 3]));
        host.focus(DocumentId::new(1));
        let runner = Arc::new(ScriptedRunner::with_script(steps));
        let orchestrator =
            Orchestrator::new(TabrunSettings::default(), host.clone(), runner.clone());
        (Hub::new(Arc::new(orchestrator)), host, runner)
    }

    fn frames(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn start(conversation_id: &str, document: u64) -> Intent {
        Intent::Start {
            conversation_id: Some(conversation_id.into()),
            query: "q".into(),
            options: Some(RunOptions::single(DocumentId::new(document))),
            metadata: tabrun_runtime::RunMetadata::default(),
            debug: false,
        }
    }

    #[tokio::test]
    async fn start_moves_document_observers_onto_run() {
        let (hub, _, _) = hub([]);
        let (conn, mut rx) = hub.connect("panel?documentId=2").await;
        assert_eq!(conn.conversation_id(), Some(ConversationId::from("doc-2")));

        let response = hub.handle(start("research", 2)).await.unwrap();
        assert!(matches!(response, IntentResponse::Run { .. }));
        assert_eq!(conn.conversation_id(), Some(ConversationId::from("research")));

        let types: Vec<_> = frames(&mut rx).into_iter().map(|f| f["type"].clone()).collect();
        assert!(types.contains(&Value::from("run.completed")), "got {types:?}");
    }

    #[tokio::test]
    async fn rejected_start_returns_observers() {
        let (hub, _, runner) = hub([]);
        let (conn, mut rx) = hub.connect("panel?documentId=9").await;
        let _ = frames(&mut rx);

        assert_matches!(
            hub.handle(start("research", 9)).await,
            Err(CoreError::DocumentUnavailable { .. })
        );
        assert!(runner.queries().is_empty());
        assert_eq!(conn.conversation_id(), Some(ConversationId::from("doc-9")));
        assert_eq!(
            hub.router().conversation_for_document(DocumentId::new(9)).await,
            Some(ConversationId::from("doc-9"))
        );
        let last = frames(&mut rx).pop().unwrap();
        assert_eq!(last["conversationId"], "doc-9");
    }

    #[tokio::test]
    async fn dispose_keeps_observers_on_the_conversation_id() {
        let (hub, _, _) = hub([]);
        let (conn, mut rx) = hub.connect("panel?conversationId=x").await;
        let _ = hub.handle(start("x", 1)).await.unwrap();
        let _ = frames(&mut rx);

        let disposed = hub
            .handle(Intent::Dispose {
                conversation_id: Some("x".into()),
                document_id: None,
            })
            .await
            .unwrap();
        assert_eq!(
            disposed,
            IntentResponse::Affected {
                conversation_ids: vec![ConversationId::from("x")]
            }
        );
        let notice = frames(&mut rx);
        assert_eq!(notice.len(), 1);
        assert_eq!(notice[0]["type"], "context.changed");
        assert_eq!(notice[0]["conversationId"], "x");
        assert!(conn.is_connected());
        assert_eq!(hub.orchestrator().bus().get_channel(&"x".into()).subscriber_count(), 1);
    }

    #[tokio::test]
    async fn document_closed_disposes_and_disconnects() {
        let (hub, host, runner) = hub([Step::WaitForCancel]);
        let (conn, _rx) = hub.connect("panel?documentId=3").await;
        let task = {
            let orchestrator = hub.orchestrator().clone();
            tokio::spawn(async move {
                orchestrator
                    .handle(Intent::Start {
                        conversation_id: None,
                        query: "q".into(),
                        options: Some(RunOptions::single(DocumentId::new(3))),
                        metadata: tabrun_runtime::RunMetadata::default(),
                        debug: false,
                    })
                    .await
            })
        };
        runner.wait_started(1).await;

        host.close(DocumentId::new(3));
        let disposed = hub.document_closed(DocumentId::new(3)).await;
        assert_eq!(disposed, vec![ConversationId::from("doc-3")]);
        assert!(!conn.is_connected());
        assert!(!hub.orchestrator().documents().contains(DocumentId::new(3)));
        assert!(!hub.orchestrator().registry().has(&ConversationId::from("doc-3")));
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn focus_change_resolves_owner() {
        let (hub, _, _) = hub([]);
        let (_w1, mut rx) = hub.connect("panel?groupId=w1").await;
        let _ = frames(&mut rx);

        assert_eq!(hub.focus_changed("w1", DocumentId::new(2)).await, 1);
        assert_eq!(frames(&mut rx)[0]["type"], "context.cleared");

        let derived = ConversationId::for_document(DocumentId::new(2));
        let _ = hub.orchestrator().registry().get_or_create(&derived);
        let _ = hub.focus_changed("w1", DocumentId::new(2)).await;
        let frame = &frames(&mut rx)[0];
        assert_eq!(frame["type"], "context.changed");
        assert_eq!(frame["conversationId"], "doc-2");
    }

    #[tokio::test]
    async fn bootstrap_reads_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"router": {"send_buffer": 4}}"#).unwrap();
        let host = Arc::new(MemoryHost::new());
        let hub = bootstrap(&path, host, Arc::new(ScriptedRunner::new())).unwrap();
        assert_eq!(hub.orchestrator().settings().router.send_buffer, 4);
        hub.shutdown().await;
        assert!(hub.orchestrator().is_shut_down());
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"resources": {"max_executions": 0}}"#).unwrap();
        let host = Arc::new(MemoryHost::new());
        let err = bootstrap(&path, host, Arc::new(ScriptedRunner::new())).err().unwrap();
        assert!(err.to_string().contains("Failed to load settings"));
    }
}
