//! Global admission control over open documents and in-flight runs.
//!
//! A `register_*` call that returns `false` is a hard rejection: callers must
//! not proceed. Abnormal teardown paths can miss an unregistration, so the
//! document pool is periodically reconciled against the host's ground truth.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tabrun_core::{ConversationId, DocumentId, Pool};
use tabrun_settings::ResourceSettings;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::document::DocumentHost;

/// Occupancy of one pool.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolUsage {
    /// Currently registered ids.
    pub current: usize,
    /// Configured cap.
    pub max: usize,
    /// `current / max` in percent.
    pub percentage: f64,
}

impl PoolUsage {
    #[allow(clippy::cast_precision_loss)]
    fn new(current: usize, max: usize) -> Self {
        let percentage = if max == 0 {
            100.0
        } else {
            current as f64 * 100.0 / max as f64
        };
        Self {
            current,
            max,
            percentage,
        }
    }
}

/// Snapshot returned by [`ResourceMonitor::usage`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Open documents.
    pub documents: PoolUsage,
    /// In-flight runs.
    pub executions: PoolUsage,
    /// Capacity warnings not yet reported within the rate-limit window.
    pub warnings: Vec<String>,
}

#[derive(Default)]
struct MonitorState {
    documents: HashSet<DocumentId>,
    executions: HashSet<ConversationId>,
    last_warning: HashMap<Pool, Instant>,
}

/// Admission control for documents and executions.
pub struct ResourceMonitor {
    limits: ResourceSettings,
    state: Mutex<MonitorState>,
}

impl ResourceMonitor {
    /// Create a monitor enforcing `limits`.
    pub fn new(limits: ResourceSettings) -> Self {
        Self {
            limits,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Configured caps.
    pub fn limits(&self) -> &ResourceSettings {
        &self.limits
    }

    /// Admit a document. `false` once the document pool is full.
    ///
    /// Registering an already-admitted document succeeds without using a slot.
    pub fn register_document(&self, id: DocumentId) -> bool {
        let mut state = self.state.lock();
        if state.documents.contains(&id) {
            return true;
        }
        if state.documents.len() >= self.limits.max_documents {
            drop(state);
            Self::record_denial(Pool::Documents, self.limits.max_documents);
            return false;
        }
        let _ = state.documents.insert(id);
        Self::record_gauge(Pool::Documents, state.documents.len());
        debug!(document_id = %id, active = state.documents.len(), "document registered");
        true
    }

    /// Release a document slot. Unknown ids are ignored.
    pub fn unregister_document(&self, id: DocumentId) -> bool {
        let mut state = self.state.lock();
        let removed = state.documents.remove(&id);
        if removed {
            Self::record_gauge(Pool::Documents, state.documents.len());
            debug!(document_id = %id, active = state.documents.len(), "document unregistered");
        }
        removed
    }

    /// Admit a run for `id`. `false` once the execution pool is full.
    ///
    /// A conversation that already holds a slot (its previous run is still
    /// winding down) keeps that slot.
    pub fn register_execution(&self, id: &ConversationId) -> bool {
        let mut state = self.state.lock();
        if state.executions.contains(id) {
            return true;
        }
        if state.executions.len() >= self.limits.max_executions {
            drop(state);
            Self::record_denial(Pool::Executions, self.limits.max_executions);
            return false;
        }
        let _ = state.executions.insert(id.clone());
        Self::record_gauge(Pool::Executions, state.executions.len());
        debug!(conversation_id = %id, active = state.executions.len(), "execution registered");
        true
    }

    /// Release the execution slot held by `id`. Unknown ids are ignored.
    pub fn unregister_execution(&self, id: &ConversationId) -> bool {
        let mut state = self.state.lock();
        let removed = state.executions.remove(id);
        if removed {
            Self::record_gauge(Pool::Executions, state.executions.len());
            debug!(
                conversation_id = %id,
                active = state.executions.len(),
                "execution unregistered"
            );
        }
        removed
    }

    /// Whether `id` currently holds a document slot.
    pub fn has_document(&self, id: DocumentId) -> bool {
        self.state.lock().documents.contains(&id)
    }

    /// Whether `id` currently holds an execution slot.
    pub fn has_execution(&self, id: &ConversationId) -> bool {
        self.state.lock().executions.contains(id)
    }

    /// Current usage of both pools.
    ///
    /// Pools at or above the warning threshold produce one warning per
    /// `warning_interval`.
    pub fn usage(&self) -> ResourceUsage {
        let now = Instant::now();
        let mut state = self.state.lock();
        let documents = PoolUsage::new(state.documents.len(), self.limits.max_documents);
        let executions = PoolUsage::new(state.executions.len(), self.limits.max_executions);

        let threshold = self.limits.warning_threshold * 100.0;
        let interval = self.limits.warning_interval();
        let mut warnings = Vec::new();
        for (pool, usage) in [(Pool::Documents, &documents), (Pool::Executions, &executions)] {
            if usage.percentage < threshold {
                continue;
            }
            let due = state
                .last_warning
                .get(&pool)
                .is_none_or(|last| now.duration_since(*last) >= interval);
            if due {
                let _ = state.last_warning.insert(pool, now);
                let message = format!(
                    "{pool} at {:.0}% of capacity ({}/{})",
                    usage.percentage, usage.current, usage.max
                );
                warn!(%pool, current = usage.current, max = usage.max, "resource usage high");
                warnings.push(message);
            }
        }

        ResourceUsage {
            documents,
            executions,
            warnings,
        }
    }

    /// Drop registered documents that are absent from `live`.
    ///
    /// Returns how many stale registrations were removed.
    pub fn reconcile(&self, live: &HashSet<DocumentId>) -> usize {
        let mut state = self.state.lock();
        let before = state.documents.len();
        state.documents.retain(|id| live.contains(id));
        let dropped = before - state.documents.len();
        if dropped > 0 {
            Self::record_gauge(Pool::Documents, state.documents.len());
            info!(
                dropped,
                active = state.documents.len(),
                "reconciled stale document registrations"
            );
        }
        dropped
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_gauge(pool: Pool, len: usize) {
        match pool {
            Pool::Documents => metrics::gauge!("tabrun_documents_active").set(len as f64),
            Pool::Executions => metrics::gauge!("tabrun_executions_active").set(len as f64),
        }
    }

    fn record_denial(pool: Pool, cap: usize) {
        metrics::counter!("tabrun_admission_denied_total", "pool" => pool.to_string()).increment(1);
        warn!(%pool, cap, "admission denied");
    }
}

/// Periodically reconcile the document pool against `host` until `cancel` fires.
pub async fn run_reconciler(
    monitor: Arc<ResourceMonitor>,
    host: Arc<dyn DocumentHost>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    // the first tick completes immediately
    let _ = ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let live: HashSet<DocumentId> = host.live_documents().await.into_iter().collect();
                let _ = monitor.reconcile(&live);
            }
            () = cancel.cancelled() => {
                debug!("resource reconciler stopped");
                return;
            }
        }
    }
}
