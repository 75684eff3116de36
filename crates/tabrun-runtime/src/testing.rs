//! In-memory collaborators for tests and embedding experiments.
//!
//! [`MemoryHost`] plays the browser: a set of open documents, an optional
//! focused one, and a record of handle traffic. [`ScriptedRunner`] plays the
//! agent: each run consumes the next [`Step`] from its script.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tabrun_core::{CoreError, DocumentId};
use tokio::sync::{Notify, watch};

use crate::document::{DocumentHandle, DocumentHost};
use crate::options::RunMetadata;
use crate::runner::{AgentRunner, RunContext};

#[derive(Default)]
struct HostState {
    documents: BTreeSet<DocumentId>,
    active: Option<DocumentId>,
    opens: HashMap<DocumentId, usize>,
}

/// A document host backed by a set of ids.
pub struct MemoryHost {
    state: Mutex<HostState>,
    disposed: Arc<Mutex<Vec<DocumentId>>>,
    next_created: AtomicU64,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    /// A host with no documents.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState::default()),
            disposed: Arc::new(Mutex::new(Vec::new())),
            next_created: AtomicU64::new(1_000),
        }
    }

    /// A host with the given documents open.
    pub fn with_documents(ids: impl IntoIterator<Item = u64>) -> Self {
        let host = Self::new();
        host.state.lock().documents.extend(ids.into_iter().map(DocumentId::new));
        host
    }

    /// Open a document.
    pub fn add(&self, id: DocumentId) {
        let _ = self.state.lock().documents.insert(id);
    }

    /// Close a document. Focus moves away from it.
    pub fn close(&self, id: DocumentId) {
        let mut state = self.state.lock();
        let _ = state.documents.remove(&id);
        if state.active == Some(id) {
            state.active = None;
        }
    }

    /// Focus a document, opening it if needed.
    pub fn focus(&self, id: DocumentId) {
        let mut state = self.state.lock();
        let _ = state.documents.insert(id);
        state.active = Some(id);
    }

    /// Remove focus.
    pub fn blur(&self) {
        self.state.lock().active = None;
    }

    /// How many handles were opened for `id`.
    pub fn open_count(&self, id: DocumentId) -> usize {
        self.state.lock().opens.get(&id).copied().unwrap_or(0)
    }

    /// Documents whose handles were disposed, in order.
    pub fn disposed(&self) -> Vec<DocumentId> {
        self.disposed.lock().clone()
    }
}

#[async_trait]
impl DocumentHost for MemoryHost {
    async fn open(&self, id: DocumentId) -> Result<Arc<dyn DocumentHandle>, CoreError> {
        let mut state = self.state.lock();
        if !state.documents.contains(&id) {
            return Err(CoreError::DocumentUnavailable {
                document_id: id,
                reason: "no such document".into(),
            });
        }
        *state.opens.entry(id).or_default() += 1;
        Ok(Arc::new(MemoryHandle {
            id,
            disposed: self.disposed.clone(),
        }))
    }

    async fn exists(&self, id: DocumentId) -> bool {
        self.state.lock().documents.contains(&id)
    }

    async fn active_document(&self) -> Option<DocumentId> {
        self.state.lock().active
    }

    async fn live_documents(&self) -> Vec<DocumentId> {
        self.state.lock().documents.iter().copied().collect()
    }

    async fn create_document(&self) -> Result<DocumentId, CoreError> {
        let id = DocumentId::new(self.next_created.fetch_add(1, Ordering::Relaxed));
        let _ = self.state.lock().documents.insert(id);
        Ok(id)
    }
}

/// Handle issued by [`MemoryHost`].
pub struct MemoryHandle {
    id: DocumentId,
    disposed: Arc<Mutex<Vec<DocumentId>>>,
}

#[async_trait]
impl DocumentHandle for MemoryHandle {
    fn document_id(&self) -> DocumentId {
        self.id
    }

    async fn dispose(&self) {
        self.disposed.lock().push(self.id);
    }
}

/// What a [`ScriptedRunner`] does for one run.
#[derive(Clone, Debug)]
pub enum Step {
    /// Return `{query, documentId}` immediately.
    Echo,
    /// Return this value.
    Complete(Value),
    /// Fail with [`CoreError::RunnerFailure`].
    Fail(String),
    /// Publish `n` progress events, then echo.
    Progress(usize),
    /// Block until cancelled, then return [`CoreError::UserCancelled`].
    WaitForCancel,
    /// Block until [`ScriptedRunner::release`] or cancellation.
    WaitForRelease,
}

/// Agent runner driven by a queue of [`Step`]s. An empty script echoes.
pub struct ScriptedRunner {
    script: Mutex<VecDeque<Step>>,
    queries: Mutex<Vec<String>>,
    started: watch::Sender<usize>,
    cancellations: AtomicUsize,
    release: Notify,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRunner {
    /// A runner that echoes every query.
    pub fn new() -> Self {
        Self::with_script([])
    }

    /// A runner that plays `steps` in order, then echoes.
    pub fn with_script(steps: impl IntoIterator<Item = Step>) -> Self {
        let (started, _) = watch::channel(0);
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            queries: Mutex::new(Vec::new()),
            started,
            cancellations: AtomicUsize::new(0),
            release: Notify::new(),
        }
    }

    /// Queue another step.
    pub fn push(&self, step: Step) {
        self.script.lock().push_back(step);
    }

    /// Queries received so far.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    /// How many runs observed their cancellation.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` runs have started.
    pub async fn wait_started(&self, count: usize) {
        let mut rx = self.started.subscribe();
        let _ = rx.wait_for(|started| *started >= count).await;
    }

    /// Let one [`Step::WaitForRelease`] run finish.
    pub fn release(&self) {
        self.release.notify_one();
    }

    fn echo(query: &str, ctx: &RunContext) -> Value {
        json!({ "query": query, "documentId": ctx.target_document() })
    }

    fn observed_cancel(&self) -> CoreError {
        let _ = self.cancellations.fetch_add(1, Ordering::SeqCst);
        CoreError::UserCancelled
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(
        &self,
        query: &str,
        _metadata: &RunMetadata,
        ctx: RunContext,
    ) -> Result<Value, CoreError> {
        let step = self.script.lock().pop_front().unwrap_or(Step::Echo);
        self.queries.lock().push(query.to_owned());
        ctx.buffer().push(json!({ "role": "user", "content": query }));
        self.started.send_modify(|started| *started += 1);

        match step {
            Step::Echo => Ok(Self::echo(query, &ctx)),
            Step::Complete(value) => Ok(value),
            Step::Fail(message) => Err(CoreError::RunnerFailure(message)),
            Step::Progress(n) => {
                for step in 0..n {
                    ctx.checkpoint().map_err(|_| self.observed_cancel())?;
                    let _ = ctx.progress(json!({ "step": step }));
                    tokio::task::yield_now().await;
                }
                Ok(Self::echo(query, &ctx))
            }
            Step::WaitForCancel => {
                ctx.cancelled().await;
                Err(self.observed_cancel())
            }
            Step::WaitForRelease => {
                tokio::select! {
                    () = self.release.notified() => Ok(Self::echo(query, &ctx)),
                    () = ctx.cancelled() => Err(self.observed_cancel()),
                }
            }
        }
    }
}
