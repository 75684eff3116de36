//! Collaborator traits for the browser surface that owns the documents.
//!
//! The core never talks to a browser directly: the embedding provides a
//! [`DocumentHost`] that answers ground-truth questions ("does tab 7 still
//! exist?", "which tab is focused?") and opens [`DocumentHandle`]s.

use std::sync::Arc;

use async_trait::async_trait;
use tabrun_core::{CoreError, DocumentId};

/// Automation-addressable state of one document.
#[async_trait]
pub trait DocumentHandle: Send + Sync {
    /// The document this handle controls.
    fn document_id(&self) -> DocumentId;

    /// Release host resources held by the handle (debugger sessions,
    /// injected scripts). Called exactly once when the handle leaves the cache.
    async fn dispose(&self);
}

/// The browser surface hosting documents.
#[async_trait]
pub trait DocumentHost: Send + Sync {
    /// Open a handle on an existing document.
    async fn open(&self, id: DocumentId) -> Result<Arc<dyn DocumentHandle>, CoreError>;

    /// Whether the document still exists.
    async fn exists(&self, id: DocumentId) -> bool;

    /// The currently focused document, if any.
    async fn active_document(&self) -> Option<DocumentId>;

    /// Every document that currently exists.
    async fn live_documents(&self) -> Vec<DocumentId>;

    /// Create a fresh document (a new tab).
    async fn create_document(&self) -> Result<DocumentId, CoreError>;
}
