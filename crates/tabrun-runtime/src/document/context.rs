//! Shared document handle cache and the conversation → document lock table.
//!
//! The cache is bounded: inserting beyond `max_size` evicts the least recently
//! accessed entry first. A periodic sweep evicts idle entries (TTL) and
//! entries whose document the host no longer knows about.
//!
//! The lock table is the sole authority on which conversation may act on
//! which document. Next to it a last-known mapping survives the end of a run,
//! so a conversation whose document was closed gets
//! [`CoreError::LostDocumentContext`] instead of being silently moved to
//! whatever document happens to be focused.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tabrun_core::{ConversationId, CoreError, DocumentId, Pool};
use tabrun_settings::DocumentCacheSettings;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::host::{DocumentHandle, DocumentHost};
use crate::resource_monitor::ResourceMonitor;

struct CacheEntry {
    handle: Arc<dyn DocumentHandle>,
    last_access: Instant,
    access_seq: u64,
}

#[derive(Default)]
struct Bindings {
    locks: HashMap<ConversationId, DocumentId>,
    last_known: HashMap<ConversationId, DocumentId>,
}

/// Why an entry left the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Eviction {
    Capacity,
    Expired,
    Closed,
}

impl Eviction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Capacity => "capacity",
            Self::Expired => "expired",
            Self::Closed => "closed",
        }
    }
}

/// Bounded document handle cache with per-conversation locks.
pub struct DocumentContext {
    host: Arc<dyn DocumentHost>,
    monitor: Arc<ResourceMonitor>,
    settings: DocumentCacheSettings,
    cache: Mutex<HashMap<DocumentId, CacheEntry>>,
    bindings: Mutex<Bindings>,
    access_counter: AtomicU64,
}

impl DocumentContext {
    /// Create an empty context backed by `host`, admitting documents through `monitor`.
    pub fn new(
        host: Arc<dyn DocumentHost>,
        monitor: Arc<ResourceMonitor>,
        settings: DocumentCacheSettings,
    ) -> Self {
        Self {
            host,
            monitor,
            settings,
            cache: Mutex::new(HashMap::new()),
            bindings: Mutex::new(Bindings::default()),
            access_counter: AtomicU64::new(0),
        }
    }

    /// The host collaborator.
    pub fn host(&self) -> &Arc<dyn DocumentHost> {
        &self.host
    }

    /// Cache settings.
    pub fn settings(&self) -> &DocumentCacheSettings {
        &self.settings
    }

    fn next_seq(&self) -> u64 {
        self.access_counter.fetch_add(1, Ordering::Relaxed)
    }

    // ── Cache ───────────────────────────────────────────────────────────

    /// Return the cached handle for `id`, opening one if needed.
    ///
    /// Opening enforces the size cap first (least recently accessed entries
    /// go), then asks the resource monitor for a document slot.
    pub async fn get_or_create(
        &self,
        id: DocumentId,
    ) -> Result<Arc<dyn DocumentHandle>, CoreError> {
        if let Some(handle) = self.touch(id) {
            return Ok(handle);
        }

        let evicted = Self::take_lru(&mut self.cache.lock(), self.settings.max_size);
        self.release(evicted, Eviction::Capacity).await;

        if !self.monitor.register_document(id) {
            return Err(CoreError::AdmissionDenied {
                pool: Pool::Documents,
                cap: self.monitor.limits().max_documents,
            });
        }

        let opened = match self.host.open(id).await {
            Ok(handle) => handle,
            Err(err) => {
                let _ = self.monitor.unregister_document(id);
                warn!(document_id = %id, error = %err, "failed to open document handle");
                return Err(err);
            }
        };

        // another task may have opened the same document while we awaited
        let (handle, duplicate, evicted) = {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get_mut(&id) {
                entry.last_access = Instant::now();
                entry.access_seq = self.next_seq();
                (entry.handle.clone(), Some(opened), Vec::new())
            } else {
                let evicted = Self::take_lru(&mut cache, self.settings.max_size);
                let _ = cache.insert(
                    id,
                    CacheEntry {
                        handle: opened.clone(),
                        last_access: Instant::now(),
                        access_seq: self.next_seq(),
                    },
                );
                (opened, None, evicted)
            }
        };
        if let Some(duplicate) = duplicate {
            duplicate.dispose().await;
        }
        self.release(evicted, Eviction::Capacity).await;
        debug!(document_id = %id, "document handle cached");
        Ok(handle)
    }

    fn touch(&self, id: DocumentId) -> Option<Arc<dyn DocumentHandle>> {
        let mut cache = self.cache.lock();
        let entry = cache.get_mut(&id)?;
        entry.last_access = Instant::now();
        entry.access_seq = self.next_seq();
        Some(entry.handle.clone())
    }

    /// Remove least recently accessed entries until one more fits.
    fn take_lru(
        cache: &mut HashMap<DocumentId, CacheEntry>,
        max_size: usize,
    ) -> Vec<(DocumentId, Arc<dyn DocumentHandle>)> {
        let mut evicted = Vec::new();
        while cache.len() >= max_size {
            let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.access_seq)
                .map(|(id, _)| *id)
            else {
                break;
            };
            if let Some(entry) = cache.remove(&oldest) {
                evicted.push((oldest, entry.handle));
            }
        }
        evicted
    }

    async fn release(&self, evicted: Vec<(DocumentId, Arc<dyn DocumentHandle>)>, reason: Eviction) {
        for (id, handle) in evicted {
            handle.dispose().await;
            let _ = self.monitor.unregister_document(id);
            if reason != Eviction::Capacity {
                self.clear_locks_for(id);
            }
            metrics::counter!("tabrun_document_evictions_total", "reason" => reason.as_str())
                .increment(1);
            debug!(document_id = %id, reason = reason.as_str(), "document handle evicted");
        }
    }

    /// Evict idle entries and entries whose document no longer exists.
    ///
    /// Documents locked by a conversation are exempt from TTL eviction; a
    /// closed document is evicted regardless. Returns the number evicted.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let ttl = self.settings.ttl();
        let snapshot: Vec<(DocumentId, Instant)> = self
            .cache
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.last_access))
            .collect();

        let mut expired = Vec::new();
        let mut closed = Vec::new();
        for (id, last_access) in snapshot {
            if !self.host.exists(id).await {
                closed.push(id);
            } else if now.duration_since(last_access) >= ttl && self.lock_holder(id).is_none() {
                expired.push(id);
            }
        }

        let (expired, closed) = {
            let mut cache = self.cache.lock();
            // touched while we were asking the host
            let still_idle: Vec<DocumentId> = expired
                .into_iter()
                .filter(|id| {
                    cache.get(id).is_some_and(|e| now.duration_since(e.last_access) >= ttl)
                })
                .collect();
            let expired: Vec<_> = still_idle
                .into_iter()
                .filter_map(|id| cache.remove(&id).map(|e| (id, e.handle)))
                .collect();
            let closed: Vec<_> = closed
                .into_iter()
                .filter_map(|id| cache.remove(&id).map(|e| (id, e.handle)))
                .collect();
            (expired, closed)
        };

        let count = expired.len() + closed.len();
        self.release(expired, Eviction::Expired).await;
        self.release(closed, Eviction::Closed).await;
        if count > 0 {
            info!(evicted = count, remaining = self.len(), "document sweep evicted handles");
        }
        count
    }

    /// Drop a closed document: dispose its handle, clear locks referencing
    /// it, and release its resource slot. Returns whether it was cached.
    pub async fn close_document(&self, id: DocumentId) -> bool {
        let entry = self.cache.lock().remove(&id);
        let cached = entry.is_some();
        if let Some(entry) = entry {
            entry.handle.dispose().await;
        }
        self.clear_locks_for(id);
        let _ = self.monitor.unregister_document(id);
        debug!(document_id = %id, cached, "document closed");
        cached
    }

    /// Dispose every cached handle and drop all bindings.
    pub async fn clear(&self) {
        let entries: Vec<_> = self.cache.lock().drain().collect();
        for (id, entry) in entries {
            entry.handle.dispose().await;
            let _ = self.monitor.unregister_document(id);
        }
        let mut bindings = self.bindings.lock();
        bindings.locks.clear();
        bindings.last_known.clear();
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Whether `id` is cached.
    pub fn contains(&self, id: DocumentId) -> bool {
        self.cache.lock().contains_key(&id)
    }

    /// Cached document ids, sorted.
    pub fn cached_documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<_> = self.cache.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // ── Locks ───────────────────────────────────────────────────────────

    /// Lock `conversation_id` to `document_id`, replacing any previous
    /// binding of either side.
    pub fn lock_conversation_to_document(
        &self,
        document_id: DocumentId,
        conversation_id: &ConversationId,
    ) {
        let mut bindings = self.bindings.lock();
        let displaced: Vec<ConversationId> = bindings
            .locks
            .iter()
            .filter(|(conv, doc)| **doc == document_id && *conv != conversation_id)
            .map(|(conv, _)| conv.clone())
            .collect();
        for conv in displaced {
            let _ = bindings.locks.remove(&conv);
            warn!(
                document_id = %document_id,
                displaced = %conv,
                by = %conversation_id,
                "document lock taken over"
            );
        }
        let _ = bindings.locks.insert(conversation_id.clone(), document_id);
        let _ = bindings.last_known.insert(conversation_id.clone(), document_id);
        debug!(
            document_id = %document_id,
            conversation_id = %conversation_id,
            "conversation locked to document"
        );
    }

    /// Release the run lock of `conversation_id`; the last-known mapping stays.
    pub fn release_lock(&self, conversation_id: &ConversationId) -> Option<DocumentId> {
        let released = self.bindings.lock().locks.remove(conversation_id);
        if let Some(doc) = released {
            debug!(
                document_id = %doc,
                conversation_id = %conversation_id,
                "document lock released"
            );
        }
        released
    }

    /// Drop every binding of `conversation_id`.
    pub fn forget_conversation(&self, conversation_id: &ConversationId) {
        let mut bindings = self.bindings.lock();
        let _ = bindings.locks.remove(conversation_id);
        let _ = bindings.last_known.remove(conversation_id);
    }

    fn clear_locks_for(&self, document_id: DocumentId) {
        let mut bindings = self.bindings.lock();
        bindings.locks.retain(|conv, doc| {
            let keep = *doc != document_id;
            if !keep {
                debug!(document_id = %document_id, conversation_id = %conv, "lock invalidated");
            }
            keep
        });
    }

    /// Document currently locked by `conversation_id`.
    pub fn locked_document(&self, conversation_id: &ConversationId) -> Option<DocumentId> {
        self.bindings.lock().locks.get(conversation_id).copied()
    }

    /// Document `conversation_id` was last bound to, locked or not.
    pub fn last_known_document(&self, conversation_id: &ConversationId) -> Option<DocumentId> {
        self.bindings.lock().last_known.get(conversation_id).copied()
    }

    /// Conversation currently holding the lock on `document_id`.
    pub fn lock_holder(&self, document_id: DocumentId) -> Option<ConversationId> {
        self.bindings
            .lock()
            .locks
            .iter()
            .find(|(_, doc)| **doc == document_id)
            .map(|(conv, _)| conv.clone())
    }

    /// Conversations locked to or last bound to `document_id`.
    pub fn conversations_for_document(&self, document_id: DocumentId) -> Vec<ConversationId> {
        let bindings = self.bindings.lock();
        let mut ids: Vec<ConversationId> = bindings
            .locks
            .iter()
            .chain(bindings.last_known.iter())
            .filter(|(_, doc)| **doc == document_id)
            .map(|(conv, _)| conv.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Resolve the document a conversation should act on.
    ///
    /// The lock table is consulted first, then the last-known mapping. A
    /// mapped document that no longer exists is an error, never a reason to
    /// substitute another one. Without any mapping (or without a
    /// conversation id) the focused document is used; a new document is
    /// created only when `allow_create` is set.
    pub async fn get_target_document(
        &self,
        conversation_id: Option<&ConversationId>,
        allow_create: bool,
    ) -> Result<DocumentId, CoreError> {
        if let Some(conversation_id) = conversation_id {
            let mapped = {
                let bindings = self.bindings.lock();
                bindings
                    .locks
                    .get(conversation_id)
                    .or_else(|| bindings.last_known.get(conversation_id))
                    .copied()
            };
            if let Some(document_id) = mapped {
                if self.host.exists(document_id).await {
                    return Ok(document_id);
                }
                warn!(
                    conversation_id = %conversation_id,
                    document_id = %document_id,
                    "bound document no longer exists"
                );
                return Err(CoreError::LostDocumentContext {
                    conversation_id: conversation_id.clone(),
                    document_id,
                });
            }
        }

        if let Some(active) = self.host.active_document().await {
            return Ok(active);
        }
        if allow_create {
            let created = self.host.create_document().await?;
            info!(document_id = %created, "created document for unbound request");
            return Ok(created);
        }
        Err(CoreError::NoTargetDocument)
    }
}

/// Sweep `context` every `interval` until `cancel` fires.
pub async fn run_sweeper(
    context: Arc<DocumentContext>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    let _ = ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = context.sweep().await;
            }
            () = cancel.cancelled() => {
                debug!("document sweeper stopped");
                return;
            }
        }
    }
}
