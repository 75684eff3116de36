//! Run controller for one conversation.
//!
//! Runs for one id are strictly sequential. A new `run()` cancels the
//! in-flight run and bumps the conversation's generation before doing
//! anything else; the stale run notices the bump when it winds down and
//! leaves the execution slot and document lock to its successor. No settling
//! delay is involved.
//!
//! Cleanup is attached to a drop guard, so a panicking runner or a caller
//! that drops the `run()` future still releases the slot and the lock.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tabrun_core::constants::PAUSED_MESSAGE;
use tabrun_core::events::ChannelEvent;
use tabrun_core::{ConversationId, CoreError, DocumentId, Pool, RunId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::channel::ChannelBus;
use crate::document::DocumentContext;
use crate::options::{ConversationOptions, RunMetadata};
use crate::resource_monitor::ResourceMonitor;
use crate::runner::{AgentRunner, ConversationBuffer, RunContext, RunParts};

/// Shared collaborators of every conversation.
#[derive(Clone)]
pub struct ConversationDeps {
    /// Document cache and lock table.
    pub documents: Arc<DocumentContext>,
    /// Admission control.
    pub monitor: Arc<ResourceMonitor>,
    /// Event channels.
    pub bus: Arc<ChannelBus>,
    /// The agent.
    pub runner: Arc<dyn AgentRunner>,
}

/// Lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No run in flight.
    Idle,
    /// A run is in flight.
    Running,
    /// Terminal.
    Disposed,
}

/// Why a run was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CancelReason {
    /// `cancel()` or `reset()`.
    User,
    /// A newer `run()` took over.
    Superseded,
    /// The conversation was disposed.
    Disposed,
}

/// How a run ended, short of an error.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The runner returned a result.
    Completed(Value),
    /// Cancelled by the user; the conversation can resume.
    Paused,
    /// A newer run took over.
    Superseded,
    /// The conversation was disposed mid-run.
    Disposed,
}

/// Snapshot returned by [`Conversation::status`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStatus {
    /// Conversation id.
    pub conversation_id: ConversationId,
    /// Lifecycle state.
    pub state: RunState,
    /// Current generation.
    pub generation: u64,
    /// In-flight run, if any.
    pub run_id: Option<RunId>,
    /// Document the in-flight run acts on.
    pub target_document: Option<DocumentId>,
    /// Document the conversation was last bound to.
    pub last_document: Option<DocumentId>,
    /// Entries in the conversation buffer.
    pub buffer_len: usize,
    /// Most recent event on the conversation's channel.
    pub last_event: Option<ChannelEvent>,
}

#[derive(Clone)]
struct ActiveRun {
    generation: u64,
    run_id: RunId,
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
    target_document: Option<DocumentId>,
}

impl ActiveRun {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            run_id: RunId::generate(),
            cancel: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
            target_document: None,
        }
    }

    /// Cancel with `reason` unless already cancelled; the first reason sticks.
    fn cancel(&self, reason: CancelReason) -> bool {
        let first = {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                false
            } else {
                *slot = Some(reason);
                true
            }
        };
        self.cancel.cancel();
        first
    }
}

#[derive(Default)]
struct Inner {
    generation: u64,
    active: Option<ActiveRun>,
    disposed: bool,
    options: ConversationOptions,
}

/// One logical, resumable dialogue.
pub struct Conversation {
    id: ConversationId,
    deps: ConversationDeps,
    buffer: ConversationBuffer,
    inner: Mutex<Inner>,
}

/// Releases the run's slot and lock when the run ends, however it ends.
struct RunGuard<'a> {
    conversation: &'a Conversation,
    generation: u64,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let _ = self.conversation.finish(self.generation);
    }
}

impl Conversation {
    /// Create an idle conversation.
    pub fn new(id: ConversationId, deps: ConversationDeps) -> Self {
        Self::with_options(id, deps, ConversationOptions::default())
    }

    /// Create an idle conversation with initial options.
    pub fn with_options(
        id: ConversationId,
        deps: ConversationDeps,
        options: ConversationOptions,
    ) -> Self {
        Self {
            id,
            deps,
            buffer: ConversationBuffer::new(),
            inner: Mutex::new(Inner {
                options,
                ..Inner::default()
            }),
        }
    }

    /// Conversation id.
    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    /// The persistent buffer.
    pub fn buffer(&self) -> &ConversationBuffer {
        &self.buffer
    }

    /// Current options.
    pub fn options(&self) -> ConversationOptions {
        self.inner.lock().options.clone()
    }

    /// Replace the options used by subsequent runs.
    pub fn set_options(&self, options: ConversationOptions) -> Result<(), CoreError> {
        options.validate()?;
        self.inner.lock().options = options;
        Ok(())
    }

    /// Whether a run is installed.
    pub fn is_running(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    /// Whether the conversation was disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Current generation; bumped by every `run()` and by `dispose()`.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Lifecycle snapshot.
    pub fn status(&self) -> ConversationStatus {
        let (state, generation, run_id, target_document) = {
            let inner = self.inner.lock();
            let state = if inner.disposed {
                RunState::Disposed
            } else if inner.active.is_some() {
                RunState::Running
            } else {
                RunState::Idle
            };
            let active = inner.active.as_ref();
            (
                state,
                inner.generation,
                active.map(|a| a.run_id.clone()),
                active.and_then(|a| a.target_document),
            )
        };
        let last_event = if self.deps.bus.has_channel(&self.id) {
            self.deps.bus.get_channel(&self.id).last_event()
        } else {
            None
        };
        ConversationStatus {
            conversation_id: self.id.clone(),
            state,
            generation,
            run_id,
            target_document,
            last_document: self.deps.documents.last_known_document(&self.id),
            buffer_len: self.buffer.len(),
            last_event,
        }
    }

    /// Run `query` to completion, superseding any in-flight run.
    ///
    /// Admission and target resolution errors are returned without
    /// publishing anything. A runner error is published as a `run.error`
    /// event and returned. Cancellation is an outcome, not an error.
    #[instrument(skip_all, fields(conversation_id = %self.id))]
    pub async fn run(&self, query: &str, metadata: &RunMetadata) -> Result<RunOutcome, CoreError> {
        let (run, options) = self.install()?;
        let generation = run.generation;
        let _guard = RunGuard {
            conversation: self,
            generation,
        };

        if !self.deps.monitor.register_execution(&self.id) {
            return Err(CoreError::AdmissionDenied {
                pool: Pool::Executions,
                cap: self.deps.monitor.limits().max_executions,
            });
        }

        let target = self.resolve_target(&options).await?;
        if let Some(outcome) = self.interrupted(&run) {
            return Ok(outcome);
        }
        let handle = self.deps.documents.get_or_create(target).await?;
        if !self.bind(&run, target) {
            return Ok(self.interrupted(&run).unwrap_or(RunOutcome::Superseded));
        }

        let channel = self.deps.bus.get_channel(&self.id);
        let started = ChannelEvent::run_started(self.id.clone(), run.run_id.clone(), target);
        let _ = channel.publish(&started);
        info!(run_id = %run.run_id, generation, document_id = %target, "run started");

        let ctx = RunContext::new(RunParts {
            run_id: run.run_id.clone(),
            generation,
            conversation_id: self.id.clone(),
            cancel: run.cancel.clone(),
            buffer: self.buffer.clone(),
            channel: channel.clone(),
            target_document: target,
            handle,
            options: options.clone(),
            documents: self.deps.documents.clone(),
        });
        let metadata = options.merged_metadata(metadata);
        let result = self.deps.runner.run(query, &metadata, ctx).await;

        if let Some(outcome) = self.interrupted(&run) {
            debug!(run_id = %run.run_id, ?outcome, "run ended after cancellation");
            return Ok(outcome);
        }
        match result {
            Ok(value) => {
                let completed =
                    ChannelEvent::completed(self.id.clone(), run.run_id.clone(), value.clone());
                let _ = channel.publish(&completed);
                info!(run_id = %run.run_id, "run completed");
                Ok(RunOutcome::Completed(value))
            }
            Err(CoreError::UserCancelled) => {
                // the runner gave up on its own
                let paused =
                    ChannelEvent::paused(self.id.clone(), Some(run.run_id.clone()), PAUSED_MESSAGE);
                let _ = channel.publish(&paused);
                Ok(RunOutcome::Paused)
            }
            Err(err) => {
                let failed = ChannelEvent::error(self.id.clone(), run.run_id.clone(), &err);
                let _ = channel.publish(&failed);
                warn!(
                    run_id = %run.run_id,
                    error = %err,
                    category = err.category(),
                    "run failed"
                );
                Err(err)
            }
        }
    }

    /// Cancel the in-flight run and install a new one under a fresh generation.
    fn install(&self) -> Result<(ActiveRun, ConversationOptions), CoreError> {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return Err(CoreError::Disposed(self.id.clone()));
        }
        if let Some(previous) = inner.active.take() {
            let _ = previous.cancel(CancelReason::Superseded);
            info!(
                superseded_run = %previous.run_id,
                generation = previous.generation,
                "superseding in-flight run"
            );
        }
        inner.generation += 1;
        let run = ActiveRun::new(inner.generation);
        inner.active = Some(run.clone());
        Ok((run, inner.options.clone()))
    }

    /// The outcome to report if `run` was cancelled.
    fn interrupted(&self, run: &ActiveRun) -> Option<RunOutcome> {
        let reason = *run.reason.lock();
        reason.map(|reason| match reason {
            CancelReason::User => RunOutcome::Paused,
            CancelReason::Superseded => RunOutcome::Superseded,
            CancelReason::Disposed => RunOutcome::Disposed,
        })
    }

    /// Lock the conversation to `target` if `run` is still current.
    fn bind(&self, run: &ActiveRun, target: DocumentId) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != run.generation {
            return false;
        }
        self.deps.documents.lock_conversation_to_document(target, &self.id);
        if let Some(active) = inner.active.as_mut() {
            active.target_document = Some(target);
        }
        true
    }

    async fn resolve_target(&self, options: &ConversationOptions) -> Result<DocumentId, CoreError> {
        let documents = &self.deps.documents;
        if let Some(explicit) = options.run.primary_document() {
            if documents.host().exists(explicit).await {
                return Ok(explicit);
            }
            return Err(CoreError::DocumentUnavailable {
                document_id: explicit,
                reason: "requested target document does not exist".into(),
            });
        }
        let mapped = documents.locked_document(&self.id).is_some()
            || documents.last_known_document(&self.id).is_some();
        if !mapped {
            if let Some(derived) = self.id.derived_document() {
                if documents.host().exists(derived).await {
                    return Ok(derived);
                }
            }
        }
        documents.get_target_document(Some(&self.id), false).await
    }

    /// Release the slot and lock held for `generation`, if it is still current.
    fn finish(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            debug!(
                conversation_id = %self.id,
                generation,
                current = inner.generation,
                "stale run cleanup skipped"
            );
            return false;
        }
        inner.active = None;
        let _ = self.deps.documents.release_lock(&self.id);
        let _ = self.deps.monitor.unregister_execution(&self.id);
        true
    }

    /// Cancel the in-flight run and publish `run.paused`.
    ///
    /// Returns `false` when nothing was running.
    pub fn cancel(&self) -> bool {
        let Some(active) = self.inner.lock().active.clone() else {
            return false;
        };
        if !active.cancel(CancelReason::User) {
            return false;
        }
        info!(conversation_id = %self.id, run_id = %active.run_id, "run cancelled by user");
        let _ = self.deps.bus.get_channel(&self.id).publish(&ChannelEvent::paused(
            self.id.clone(),
            Some(active.run_id),
            PAUSED_MESSAGE,
        ));
        true
    }

    /// Cancel any run, clear the buffer and the channel's backlog.
    pub fn reset(&self) -> bool {
        let cancelled = self.cancel();
        self.buffer.clear();
        if self.deps.bus.has_channel(&self.id) {
            self.deps.bus.get_channel(&self.id).reset();
        }
        debug!(conversation_id = %self.id, cancelled, "conversation reset");
        cancelled
    }

    /// Terminal teardown: cancel, release slot and lock, forget mappings.
    pub fn dispose(&self) {
        let active = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.generation += 1;
            inner.active.take()
        };
        if let Some(active) = active {
            let _ = active.cancel(CancelReason::Disposed);
        }
        let _ = self.deps.monitor.unregister_execution(&self.id);
        self.deps.documents.forget_conversation(&self.id);
        self.buffer.clear();
        info!(conversation_id = %self.id, "conversation disposed");
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}
