//! Observer connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tabrun_core::events::{ChannelEvent, ContextNotification};
use tabrun_core::{ConnectionId, ConversationId, DocumentId};
use tokio::sync::mpsc;

use crate::routing::RoutingHints;

/// An external observer (side panel, popup, devtools page) receiving JSON
/// text frames.
pub struct ObserverConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    identity: String,
    hints: RoutingHints,
    /// Send side of the observer's write queue; `None` once disconnected.
    tx: Mutex<Option<mpsc::Sender<Arc<String>>>>,
    /// When this connection was established.
    pub connected_at: Instant,
    dropped_messages: AtomicU64,
    binding: Mutex<(Option<ConversationId>, Option<DocumentId>)>,
}

impl ObserverConnection {
    /// Create a connection; routing hints are parsed from `identity`.
    pub fn new(identity: impl Into<String>, tx: mpsc::Sender<Arc<String>>) -> Self {
        let identity = identity.into();
        Self {
            id: ConnectionId::generate(),
            hints: RoutingHints::parse(&identity),
            identity,
            tx: Mutex::new(Some(tx)),
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
            binding: Mutex::new((None, None)),
        }
    }

    /// Create a connection with a bounded queue of `capacity` frames.
    pub fn channel(
        identity: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(identity, tx)), rx)
    }

    /// Raw identity string.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Hints parsed from the identity.
    pub fn hints(&self) -> &RoutingHints {
        &self.hints
    }

    /// Document group this observer belongs to.
    pub fn group_id(&self) -> Option<&str> {
        self.hints.group_id.as_deref()
    }

    /// Currently bound conversation.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.binding.lock().0.clone()
    }

    /// Currently associated document.
    pub fn document_id(&self) -> Option<DocumentId> {
        self.binding.lock().1
    }

    pub(crate) fn bind(
        &self,
        conversation_id: Option<ConversationId>,
        document_id: Option<DocumentId>,
    ) {
        *self.binding.lock() = (conversation_id, document_id);
    }

    /// Queue a text frame.
    ///
    /// Returns `false` if the queue is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        let sent = self
            .tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.try_send(message).is_ok());
        if !sent {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Serialize a JSON value and queue it.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Forward a channel event; the error names why delivery failed.
    pub fn send_event(&self, event: &ChannelEvent) -> Result<(), String> {
        let json = serde_json::to_string(event).map_err(|e| e.to_string())?;
        if self.send(Arc::new(json)) {
            Ok(())
        } else {
            Err(format!("observer {} queue full or closed", self.id))
        }
    }

    /// Push a context notification.
    pub fn notify(&self, notification: &ContextNotification) -> bool {
        self.send_json(&notification.to_message())
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Close the write queue. The receiver sees the end of the stream once
    /// buffered frames are drained.
    pub fn disconnect(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    /// Whether the write queue is still open.
    pub fn is_connected(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ObserverConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverConnection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn create_connection_parses_identity() {
        let (conn, _rx) = ObserverConnection::channel("panel?documentId=3&groupId=w1", 8);
        assert_eq!(conn.hints().document_id, Some(DocumentId::new(3)));
        assert_eq!(conn.group_id(), Some("w1"));
        assert!(conn.conversation_id().is_none());
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn send_event_serializes_frame() {
        let (conn, mut rx) = ObserverConnection::channel("panel", 8);
        let event = ChannelEvent::new("run.progress", ConversationId::from("x"));
        conn.send_event(&event).unwrap();
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "run.progress");
        assert_eq!(frame["conversationId"], "x");
    }

    #[test]
    fn full_queue_counts_drops() {
        let (conn, _rx) = ObserverConnection::channel("panel", 1);
        assert!(conn.send(Arc::new("one".into())));
        assert!(!conn.send(Arc::new("two".into())));
        assert!(conn.send_event(&ChannelEvent::new("e", ConversationId::from("x"))).is_err());
        assert_eq!(conn.drop_count(), 2);
    }

    #[tokio::test]
    async fn disconnect_closes_stream() {
        let (conn, mut rx) = ObserverConnection::channel("panel", 4);
        assert!(conn.send(Arc::new("last".into())));
        assert!(conn.disconnect());
        assert!(!conn.disconnect());
        assert!(!conn.is_connected());
        assert!(!conn.send(Arc::new("late".into())));
        assert_eq!(rx.recv().await.as_deref().map(String::as_str), Some("last"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn notify_sends_context_message() {
        let (conn, mut rx) = ObserverConnection::channel("panel", 4);
        let notification = ContextNotification {
            conversation_id: None,
            document_id: Some(DocumentId::new(5)),
        };
        assert!(conn.notify(&notification));
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "context.cleared");
        assert_eq!(frame["documentId"], 5);
        assert!(frame["conversationId"].is_null());
    }
}
