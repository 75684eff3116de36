//! Wires the core together and dispatches trigger intents.
//!
//! There are no process-wide singletons: every [`Orchestrator`] owns its own
//! monitor, document context, bus and registry, plus the background sweep
//! and reconcile loops, which stop on [`Orchestrator::shutdown`] or drop.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tabrun_core::{ConversationId, CoreError, DocumentId};
use tabrun_settings::TabrunSettings;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::channel::ChannelBus;
use crate::conversation::{ConversationDeps, ConversationStatus, RunOutcome};
use crate::document::{DocumentContext, DocumentHost, run_sweeper};
use crate::options::{RunMetadata, RunOptions};
use crate::registry::ConversationRegistry;
use crate::resource_monitor::{ResourceMonitor, ResourceUsage, run_reconciler};
use crate::runner::AgentRunner;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One inbound trigger.
///
/// Without a conversation id, `document_id` selects the conversations bound
/// to that document; with neither, the intent addresses every live
/// conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Intent {
    /// Run a query.
    Start {
        /// Explicit conversation id.
        #[serde(default)]
        conversation_id: Option<String>,
        /// The goal, passed to the runner untouched.
        query: String,
        /// Target selection; keeps the conversation's current options when absent.
        #[serde(default)]
        options: Option<RunOptions>,
        /// Caller metadata.
        #[serde(default)]
        metadata: RunMetadata,
        /// Verbose runner diagnostics.
        #[serde(default)]
        debug: bool,
    },
    /// Cancel in-flight runs.
    Cancel {
        /// Explicit conversation id.
        #[serde(default)]
        conversation_id: Option<String>,
        /// Document whose conversations are addressed.
        #[serde(default)]
        document_id: Option<DocumentId>,
    },
    /// Cancel and clear conversation state.
    Reset {
        /// Explicit conversation id.
        #[serde(default)]
        conversation_id: Option<String>,
        /// Document whose conversations are addressed.
        #[serde(default)]
        document_id: Option<DocumentId>,
    },
    /// Tear conversations down.
    Dispose {
        /// Explicit conversation id.
        #[serde(default)]
        conversation_id: Option<String>,
        /// Document whose conversations are addressed.
        #[serde(default)]
        document_id: Option<DocumentId>,
    },
    /// Report usage and conversation state.
    Status {
        /// Explicit conversation id.
        #[serde(default)]
        conversation_id: Option<String>,
        /// Document whose conversations are addressed.
        #[serde(default)]
        document_id: Option<DocumentId>,
    },
}

/// Result of [`Orchestrator::handle`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum IntentResponse {
    /// A `Start` ran to an outcome.
    Run {
        /// Resolved conversation id.
        conversation_id: ConversationId,
        /// How the run ended.
        outcome: RunOutcome,
    },
    /// Conversations a cancel/reset/dispose actually affected.
    Affected {
        /// Affected ids.
        conversation_ids: Vec<ConversationId>,
    },
    /// Usage and state snapshot.
    Status {
        /// Resource pools.
        usage: ResourceUsage,
        /// Addressed conversations.
        conversations: Vec<ConversationStatus>,
    },
}

/// The orchestration core.
pub struct Orchestrator {
    settings: TabrunSettings,
    monitor: Arc<ResourceMonitor>,
    documents: Arc<DocumentContext>,
    bus: Arc<ChannelBus>,
    registry: Arc<ConversationRegistry>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build the core without background loops.
    pub fn new(
        settings: TabrunSettings,
        host: Arc<dyn DocumentHost>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        let monitor = Arc::new(ResourceMonitor::new(settings.resources.clone()));
        let documents = Arc::new(DocumentContext::new(
            host,
            monitor.clone(),
            settings.documents.clone(),
        ));
        let bus = Arc::new(ChannelBus::new());
        let registry = Arc::new(ConversationRegistry::new(ConversationDeps {
            documents: documents.clone(),
            monitor: monitor.clone(),
            bus: bus.clone(),
            runner,
        }));
        Self {
            settings,
            monitor,
            documents,
            bus,
            registry,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build the core and spawn the document sweep and resource reconcile
    /// loops. Must be called inside a tokio runtime.
    pub fn start(
        settings: TabrunSettings,
        host: Arc<dyn DocumentHost>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        let orchestrator = Self::new(settings, host.clone(), runner);
        let sweeper = tokio::spawn(run_sweeper(
            orchestrator.documents.clone(),
            orchestrator.settings.documents.sweep_interval(),
            orchestrator.shutdown.child_token(),
        ));
        let reconciler = tokio::spawn(run_reconciler(
            orchestrator.monitor.clone(),
            host,
            orchestrator.settings.resources.reconcile_interval(),
            orchestrator.shutdown.child_token(),
        ));
        orchestrator.tasks.lock().extend([sweeper, reconciler]);
        info!(
            max_documents = orchestrator.settings.resources.max_documents,
            max_executions = orchestrator.settings.resources.max_executions,
            cache_size = orchestrator.settings.documents.max_size,
            "orchestrator started"
        );
        orchestrator
    }

    /// Dispose every conversation, stop the background loops and drop all
    /// cached document handles.
    pub async fn shutdown(&self) {
        let disposed = self.registry.dispose_all();
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock());
        let task_count = handles.len();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(timeout = ?SHUTDOWN_TIMEOUT, "background tasks did not stop in time");
        }
        self.documents.clear().await;
        info!(disposed, task_count, "orchestrator stopped");
    }

    /// Whether [`Self::shutdown`] was called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Effective settings.
    pub fn settings(&self) -> &TabrunSettings {
        &self.settings
    }

    /// Admission control.
    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Document cache and locks.
    pub fn documents(&self) -> &Arc<DocumentContext> {
        &self.documents
    }

    /// Event channels.
    pub fn bus(&self) -> &Arc<ChannelBus> {
        &self.bus
    }

    /// Live conversations.
    pub fn registry(&self) -> &Arc<ConversationRegistry> {
        &self.registry
    }

    /// Resolve the conversation a start trigger belongs to.
    ///
    /// Explicit id, then the id embedded in metadata, then `doc-<n>` for the
    /// primary target document, then the configured default.
    pub fn resolve_conversation_id(
        &self,
        explicit: Option<&str>,
        metadata: &RunMetadata,
        options: Option<&RunOptions>,
    ) -> ConversationId {
        let blank = |s: Option<&str>| s.is_none_or(|s| s.trim().is_empty());
        let primary = options.and_then(RunOptions::primary_document);
        if blank(explicit) && blank(metadata.conversation_id.as_deref()) && primary.is_none() {
            return ConversationId::from(self.settings.conversations.default_conversation_id.trim());
        }
        ConversationId::resolve(explicit, metadata.conversation_id.as_deref(), primary)
    }

    /// Conversations addressed by an id-or-document hint.
    fn targets(
        &self,
        conversation_id: Option<&str>,
        document_id: Option<DocumentId>,
    ) -> Vec<ConversationId> {
        if let Some(id) = conversation_id.map(str::trim).filter(|s| !s.is_empty()) {
            return vec![ConversationId::from(id)];
        }
        let Some(document_id) = document_id else {
            return self.registry.list_ids();
        };
        let mut ids = self.documents.conversations_for_document(document_id);
        ids.push(ConversationId::for_document(document_id));
        ids.sort();
        ids.dedup();
        ids.retain(|id| self.registry.has(id));
        ids
    }

    /// Dispatch one trigger.
    #[instrument(skip_all, fields(intent = intent_name(&intent)))]
    pub async fn handle(&self, intent: Intent) -> Result<IntentResponse, CoreError> {
        match intent {
            Intent::Start {
                conversation_id,
                query,
                options,
                metadata,
                debug,
            } => {
                if let Some(options) = &options {
                    options.validate()?;
                }
                let id = self.resolve_conversation_id(
                    conversation_id.as_deref(),
                    &metadata,
                    options.as_ref(),
                );
                let conversation = self.registry.get_or_create(&id);
                let mut conversation_options = conversation.options();
                if let Some(options) = options {
                    conversation_options.run = options;
                }
                conversation_options.debug = debug;
                conversation.set_options(conversation_options)?;

                debug!(conversation_id = %id, "dispatching start");
                let outcome = conversation.run(&query, &metadata).await?;
                Ok(IntentResponse::Run {
                    conversation_id: id,
                    outcome,
                })
            }
            Intent::Cancel {
                conversation_id,
                document_id,
            } => {
                let conversation_ids = self
                    .targets(conversation_id.as_deref(), document_id)
                    .into_iter()
                    .filter(|id| self.registry.cancel(id))
                    .collect();
                Ok(IntentResponse::Affected { conversation_ids })
            }
            Intent::Reset {
                conversation_id,
                document_id,
            } => {
                let conversation_ids = self
                    .targets(conversation_id.as_deref(), document_id)
                    .into_iter()
                    .filter(|id| self.registry.reset(id))
                    .collect();
                Ok(IntentResponse::Affected { conversation_ids })
            }
            Intent::Dispose {
                conversation_id,
                document_id,
            } => {
                let conversation_ids = self
                    .targets(conversation_id.as_deref(), document_id)
                    .into_iter()
                    .filter(|id| self.registry.dispose(id))
                    .collect();
                Ok(IntentResponse::Affected { conversation_ids })
            }
            Intent::Status {
                conversation_id,
                document_id,
            } => {
                let conversations = self
                    .targets(conversation_id.as_deref(), document_id)
                    .iter()
                    .filter_map(|id| self.registry.status(id))
                    .collect();
                Ok(IntentResponse::Status {
                    usage: self.monitor.usage(),
                    conversations,
                })
            }
        }
    }
}

fn intent_name(intent: &Intent) -> &'static str {
    match intent {
        Intent::Start { .. } => "start",
        Intent::Cancel { .. } => "cancel",
        Intent::Reset { .. } => "reset",
        Intent::Dispose { .. } => "dispose",
        Intent::Status { .. } => "status",
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
