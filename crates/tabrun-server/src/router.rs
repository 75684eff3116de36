//! Binds observer connections to conversation channels.
//!
//! Each registered connection has at most one channel subscription. The
//! router also tracks which conversation each document is currently assigned
//! to, so observers attaching to a document follow the conversation already
//! running there instead of a freshly derived one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tabrun_core::events::ContextNotification;
use tabrun_core::{ConnectionId, ConversationId, DocumentId};
use tabrun_runtime::{ChannelBus, Subscription};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::ObserverConnection;

struct Route {
    connection: Arc<ObserverConnection>,
    conversation_id: Option<ConversationId>,
    document_id: Option<DocumentId>,
    subscription: Option<Subscription>,
}

#[derive(Default)]
struct RouterState {
    routes: HashMap<ConnectionId, Route>,
    assignments: HashMap<DocumentId, ConversationId>,
}

impl Route {
    /// Whether the route follows `conversation_id` on its live channel.
    /// A subscription left on a deleted channel does not count.
    fn follows(&self, bus: &ChannelBus, conversation_id: &ConversationId) -> bool {
        self.conversation_id.as_ref() == Some(conversation_id)
            && self.subscription.as_ref().is_some_and(|s| bus.is_current(conversation_id, s))
    }
}

impl RouterState {
    #[allow(clippy::cast_precision_loss)]
    fn record_connections(&self) {
        metrics::gauge!("tabrun_observer_connections").set(self.routes.len() as f64);
    }

    fn document_in_use(&self, document_id: DocumentId) -> bool {
        self.routes.values().any(|r| r.document_id == Some(document_id))
    }
}

/// Observers moved by [`ConnectionRouter::assign_document`], kept so the
/// move can be undone with [`ConnectionRouter::revert_assignment`].
pub struct DocumentMove {
    document_id: DocumentId,
    previous: Option<ConversationId>,
    moved: Vec<(Arc<ObserverConnection>, Option<ConversationId>)>,
}

impl DocumentMove {
    /// Number of connections moved.
    pub fn len(&self) -> usize {
        self.moved.len()
    }

    /// Whether nothing moved.
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty()
    }
}

/// Observer connection multiplexer.
pub struct ConnectionRouter {
    bus: Arc<ChannelBus>,
    state: RwLock<RouterState>,
}

impl ConnectionRouter {
    /// Create a router publishing from `bus`.
    pub fn new(bus: Arc<ChannelBus>) -> Self {
        Self {
            bus,
            state: RwLock::new(RouterState::default()),
        }
    }

    fn subscribe(
        &self,
        connection: &Arc<ObserverConnection>,
        conversation_id: &ConversationId,
    ) -> Subscription {
        let weak: Weak<ObserverConnection> = Arc::downgrade(connection);
        self.bus.subscribe(conversation_id, move |event| match weak.upgrade() {
            Some(connection) => connection.send_event(event),
            None => Err("observer dropped".into()),
        })
    }

    fn notify(
        connection: &ObserverConnection,
        conversation_id: Option<ConversationId>,
        document_id: Option<DocumentId>,
    ) {
        let notification = ContextNotification {
            conversation_id,
            document_id,
        };
        if !connection.notify(&notification) {
            warn!(conn_id = %connection.id, "failed to push context notification");
        }
    }

    /// Register `connection`, subscribing it to the conversation its
    /// identity points at, and push the current context.
    ///
    /// Resolution: explicit conversation id, then the conversation already
    /// assigned to the hinted document, then the id derived from that
    /// document. Returns the bound conversation, if any.
    pub async fn register_connection(
        &self,
        connection: Arc<ObserverConnection>,
    ) -> Option<ConversationId> {
        let hints = connection.hints().clone();
        let mut state = self.state.write().await;

        let conversation_id = hints.conversation_id.clone().or_else(|| {
            hints
                .document_id
                .and_then(|doc| state.assignments.get(&doc).cloned())
                .or_else(|| hints.conversation())
        });
        let subscription = conversation_id.as_ref().map(|id| self.subscribe(&connection, id));
        if let (Some(doc), Some(id)) = (hints.document_id, conversation_id.as_ref()) {
            let _ = state.assignments.insert(doc, id.clone());
        }

        connection.bind(conversation_id.clone(), hints.document_id);
        Self::notify(&connection, conversation_id.clone(), hints.document_id);
        if let Some(previous) = state.routes.insert(
            connection.id.clone(),
            Route {
                connection: connection.clone(),
                conversation_id: conversation_id.clone(),
                document_id: hints.document_id,
                subscription,
            },
        ) {
            warn!(
                conn_id = %previous.connection.id,
                "connection registered twice, replacing route"
            );
        }
        state.record_connections();
        info!(
            conn_id = %connection.id,
            kind = %hints.kind,
            conversation_id = ?conversation_id,
            connections = state.routes.len(),
            "observer connected"
        );
        conversation_id
    }

    /// Move `connection` to `conversation_id`, associating it with
    /// `document_id`, and re-notify it.
    ///
    /// Rebinding to the conversation it already follows refreshes the
    /// notification without adding a second subscription, unless that
    /// subscription sits on a deleted channel. An unknown connection is
    /// registered on the spot.
    pub async fn rebind(
        &self,
        connection: &Arc<ObserverConnection>,
        conversation_id: ConversationId,
        document_id: Option<DocumentId>,
    ) {
        let mut state = self.state.write().await;

        let (old_document, subscription) = match state.routes.remove(&connection.id) {
            Some(mut route) => {
                if route.follows(&self.bus, &conversation_id) {
                    (route.document_id, route.subscription.take())
                } else {
                    // dropping the old subscription unsubscribes it
                    drop(route.subscription.take());
                    (route.document_id, Some(self.subscribe(connection, &conversation_id)))
                }
            }
            None => (None, Some(self.subscribe(connection, &conversation_id))),
        };

        let document_id = document_id.or(old_document);
        let _ = state.routes.insert(
            connection.id.clone(),
            Route {
                connection: connection.clone(),
                conversation_id: Some(conversation_id.clone()),
                document_id,
                subscription,
            },
        );
        if let Some(old) = old_document.filter(|old| Some(*old) != document_id) {
            if !state.document_in_use(old) {
                let _ = state.assignments.remove(&old);
            }
        }
        if let Some(doc) = document_id {
            let _ = state.assignments.insert(doc, conversation_id.clone());
        }

        connection.bind(Some(conversation_id.clone()), document_id);
        Self::notify(connection, Some(conversation_id.clone()), document_id);
        debug!(
            conn_id = %connection.id,
            conversation_id = %conversation_id,
            document_id = ?document_id,
            "observer rebound"
        );
    }

    /// Drop `connection_id`'s subscription. The last connection of a
    /// document purges that document's assignment.
    pub async fn unregister_connection(&self, connection_id: &ConnectionId) -> bool {
        let mut state = self.state.write().await;
        let Some(route) = state.routes.remove(connection_id) else {
            return false;
        };
        if let Some(doc) = route.document_id {
            if !state.document_in_use(doc) {
                let _ = state.assignments.remove(&doc);
                debug!(document_id = %doc, "last observer of document left");
            }
        }
        state.record_connections();
        info!(
            conn_id = %connection_id,
            connections = state.routes.len(),
            "observer disconnected"
        );
        true
    }

    /// Force-disconnect every connection associated with a closed document
    /// and purge its assignment. Returns how many were disconnected.
    pub async fn cleanup_for_document(&self, document_id: DocumentId) -> usize {
        let mut state = self.state.write().await;
        let doomed: Vec<ConnectionId> = state
            .routes
            .iter()
            .filter(|(_, r)| r.document_id == Some(document_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            if let Some(route) = state.routes.remove(id) {
                let _ = route.connection.disconnect();
            }
        }
        let _ = state.assignments.remove(&document_id);
        state.record_connections();
        if !doomed.is_empty() {
            info!(
                document_id = %document_id,
                disconnected = doomed.len(),
                "observers of closed document disconnected"
            );
        }
        doomed.len()
    }

    /// Push a context notification to every connection of `group_id`.
    ///
    /// `Some(conversation)` sends `context.changed` and records the
    /// assignment; `None` sends `context.cleared`. Returns how many
    /// connections were notified.
    pub async fn broadcast_to_document_group(
        &self,
        group_id: &str,
        document_id: DocumentId,
        conversation_id: Option<ConversationId>,
    ) -> usize {
        let mut state = self.state.write().await;
        if let Some(id) = &conversation_id {
            let _ = state.assignments.insert(document_id, id.clone());
        }
        let recipients: Vec<_> = state
            .routes
            .values()
            .filter(|r| r.connection.group_id() == Some(group_id))
            .map(|r| r.connection.clone())
            .collect();
        drop(state);

        for connection in &recipients {
            Self::notify(connection, conversation_id.clone(), Some(document_id));
        }
        debug!(
            group_id,
            document_id = %document_id,
            recipients = recipients.len(),
            "group context broadcast"
        );
        recipients.len()
    }

    /// Assign `document_id` to `conversation_id` and rebind every connection
    /// of that document that does not already follow it on a live channel.
    pub async fn assign_document(
        &self,
        document_id: DocumentId,
        conversation_id: &ConversationId,
    ) -> DocumentMove {
        let (previous, moved) = {
            let mut state = self.state.write().await;
            let previous = state.assignments.insert(document_id, conversation_id.clone());
            let moved: Vec<_> = state
                .routes
                .values()
                .filter(|r| {
                    r.document_id == Some(document_id) && !r.follows(&self.bus, conversation_id)
                })
                .map(|r| (r.connection.clone(), r.conversation_id.clone()))
                .collect();
            (previous, moved)
        };
        for (connection, _) in &moved {
            self.rebind(connection, conversation_id.clone(), Some(document_id)).await;
        }
        DocumentMove {
            document_id,
            previous,
            moved,
        }
    }

    /// Undo an [`Self::assign_document`]: moved connections go back to the
    /// conversation they followed and the document's assignment is restored.
    pub async fn revert_assignment(&self, document_move: DocumentMove) {
        let DocumentMove {
            document_id,
            previous,
            moved,
        } = document_move;
        for (connection, earlier) in &moved {
            if let Some(earlier) = earlier {
                self.rebind(connection, earlier.clone(), Some(document_id)).await;
            }
        }
        let mut state = self.state.write().await;
        match &previous {
            Some(id) => {
                let _ = state.assignments.insert(document_id, id.clone());
            }
            None => {
                let _ = state.assignments.remove(&document_id);
            }
        }
        debug!(
            document_id = %document_id,
            restored = ?previous,
            reverted = moved.len(),
            "document assignment reverted"
        );
    }

    /// Resubscribe every connection following `conversation_id` whose
    /// subscription was left on a deleted channel, and re-notify it.
    /// Returns how many were refreshed.
    pub async fn refresh_conversation(&self, conversation_id: &ConversationId) -> usize {
        let stale: Vec<_> = self
            .state
            .read()
            .await
            .routes
            .values()
            .filter(|r| {
                r.conversation_id.as_ref() == Some(conversation_id)
                    && !r.follows(&self.bus, conversation_id)
            })
            .map(|r| r.connection.clone())
            .collect();
        for connection in &stale {
            self.rebind(connection, conversation_id.clone(), None).await;
        }
        if !stale.is_empty() {
            debug!(
                conversation_id = %conversation_id,
                refreshed = stale.len(),
                "observers resubscribed to fresh channel"
            );
        }
        stale.len()
    }

    /// Conversation currently assigned to `document_id`.
    pub async fn conversation_for_document(
        &self,
        document_id: DocumentId,
    ) -> Option<ConversationId> {
        self.state.read().await.assignments.get(&document_id).cloned()
    }

    /// Connections following `conversation_id`.
    pub async fn connections_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Vec<Arc<ObserverConnection>> {
        self.state
            .read()
            .await
            .routes
            .values()
            .filter(|r| r.conversation_id.as_ref() == Some(conversation_id))
            .map(|r| r.connection.clone())
            .collect()
    }

    /// Disconnect and forget every connection.
    pub async fn disconnect_all(&self) -> usize {
        let mut state = self.state.write().await;
        let count = state.routes.len();
        for (_, route) in state.routes.drain() {
            let _ = route.connection.disconnect();
        }
        state.assignments.clear();
        state.record_connections();
        count
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tabrun_core::events::ChannelEvent;
    use tokio::sync::mpsc;

    fn router() -> (ConnectionRouter, Arc<ChannelBus>) {
        let bus = Arc::new(ChannelBus::new());
        (ConnectionRouter::new(bus.clone()), bus)
    }

    fn frames(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn conv(id: &str) -> ConversationId {
        ConversationId::from(id)
    }

    #[tokio::test]
    async fn register_with_explicit_conversation() {
        let (router, bus) = router();
        let (conn, mut rx) = ObserverConnection::channel("panel?conversationId=x", 16);
        assert_eq!(router.register_connection(conn.clone()).await, Some(conv("x")));

        let hello = frames(&mut rx);
        assert_eq!(hello.len(), 1);
        assert_eq!(hello[0]["type"], "context.changed");
        assert_eq!(hello[0]["conversationId"], "x");

        let _ = bus.publish(&conv("x"), &ChannelEvent::new("run.progress", conv("x")));
        let _ = bus.publish(&conv("y"), &ChannelEvent::new("run.progress", conv("y")));
        let events = frames(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["conversationId"], "x");
    }

    #[tokio::test]
    async fn register_with_document_derives_or_follows_assignment() {
        let (router, _) = router();
        let (first, _rx1) = ObserverConnection::channel("panel?documentId=7", 16);
        assert_eq!(router.register_connection(first.clone()).await, Some(conv("doc-7")));

        router.rebind(&first, conv("research"), Some(DocumentId::new(7))).await;
        let (second, _rx2) = ObserverConnection::channel("popup?documentId=7", 16);
        assert_eq!(router.register_connection(second).await, Some(conv("research")));
    }

    #[tokio::test]
    async fn register_without_hints_sends_cleared() {
        let (router, _) = router();
        let (conn, mut rx) = ObserverConnection::channel("devtools", 16);
        assert_eq!(router.register_connection(conn).await, None);
        let hello = frames(&mut rx);
        assert_eq!(hello[0]["type"], "context.cleared");
    }

    #[tokio::test]
    async fn rebind_moves_subscription_and_is_idempotent() {
        let (router, bus) = router();
        let (conn, mut rx) = ObserverConnection::channel("panel?conversationId=a", 16);
        let _ = router.register_connection(conn.clone()).await;

        router.rebind(&conn, conv("b"), None).await;
        router.rebind(&conn, conv("b"), None).await;
        assert_eq!(bus.get_channel(&conv("a")).subscriber_count(), 0);
        assert_eq!(bus.get_channel(&conv("b")).subscriber_count(), 1);
        assert_eq!(conn.conversation_id(), Some(conv("b")));

        let _ = frames(&mut rx);
        let _ = bus.publish(&conv("a"), &ChannelEvent::new("stale", conv("a")));
        let _ = bus.publish(&conv("b"), &ChannelEvent::new("fresh", conv("b")));
        let events = frames(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "fresh");
    }

    #[tokio::test]
    async fn rebind_resubscribes_after_channel_recreated() {
        let (router, bus) = router();
        let (conn, mut rx) = ObserverConnection::channel("panel?conversationId=a", 16);
        let _ = router.register_connection(conn.clone()).await;
        assert!(bus.delete_channel(&conv("a"), true));

        router.rebind(&conn, conv("a"), None).await;
        let _ = frames(&mut rx);
        let _ = bus.publish(&conv("a"), &ChannelEvent::new("again", conv("a")));
        assert_eq!(frames(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn last_connection_of_document_purges_assignment() {
        let (router, bus) = router();
        let (a, _ra) = ObserverConnection::channel("panel?documentId=3", 16);
        let (b, _rb) = ObserverConnection::channel("popup?documentId=3", 16);
        let _ = router.register_connection(a.clone()).await;
        let _ = router.register_connection(b.clone()).await;

        assert!(router.unregister_connection(&a.id).await);
        assert_eq!(
            router.conversation_for_document(DocumentId::new(3)).await,
            Some(conv("doc-3"))
        );
        assert!(router.unregister_connection(&b.id).await);
        assert_eq!(router.conversation_for_document(DocumentId::new(3)).await, None);
        assert!(!router.unregister_connection(&b.id).await);
        assert_eq!(bus.get_channel(&conv("doc-3")).subscriber_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_for_document_disconnects_bound_connections() {
        let (router, _) = router();
        let (a, mut ra) = ObserverConnection::channel("panel?documentId=3", 16);
        let (b, _rb) = ObserverConnection::channel("panel?documentId=4", 16);
        let _ = router.register_connection(a.clone()).await;
        let _ = router.register_connection(b.clone()).await;

        assert_eq!(router.cleanup_for_document(DocumentId::new(3)).await, 1);
        assert!(!a.is_connected());
        assert!(b.is_connected());
        assert_eq!(router.connection_count().await, 1);
        let _ = frames(&mut ra);
        assert!(ra.recv().await.is_none());
    }

    #[tokio::test]
    async fn assign_document_moves_its_observers() {
        let (router, bus) = router();
        let (a, _ra) = ObserverConnection::channel("panel?documentId=5", 16);
        let (b, _rb) = ObserverConnection::channel("panel?documentId=6", 16);
        let _ = router.register_connection(a.clone()).await;
        let _ = router.register_connection(b.clone()).await;

        assert_eq!(router.assign_document(DocumentId::new(5), &conv("task")).await.len(), 1);
        assert!(router.assign_document(DocumentId::new(5), &conv("task")).await.is_empty());
        assert_eq!(a.conversation_id(), Some(conv("task")));
        assert_eq!(b.conversation_id(), Some(conv("doc-6")));
        assert_eq!(bus.get_channel(&conv("doc-5")).subscriber_count(), 0);
        assert_eq!(router.connections_for_conversation(&conv("task")).await.len(), 1);
    }

    #[tokio::test]
    async fn assign_document_moves_routes_left_on_deleted_channel() {
        let (router, bus) = router();
        let (a, mut ra) = ObserverConnection::channel("panel?documentId=5", 16);
        let _ = router.register_connection(a.clone()).await;
        let _ = router.assign_document(DocumentId::new(5), &conv("task")).await;
        assert!(bus.delete_channel(&conv("task"), true));

        assert_eq!(router.assign_document(DocumentId::new(5), &conv("task")).await.len(), 1);
        let _ = frames(&mut ra);
        let _ = bus.publish(&conv("task"), &ChannelEvent::new("run.started", conv("task")));
        assert_eq!(frames(&mut ra)[0]["type"], "run.started");
    }

    #[tokio::test]
    async fn revert_assignment_restores_observers_and_assignment() {
        let (router, bus) = router();
        let (a, mut ra) = ObserverConnection::channel("panel?documentId=5", 16);
        let _ = router.register_connection(a.clone()).await;

        let moved = router.assign_document(DocumentId::new(5), &conv("task")).await;
        assert_eq!(a.conversation_id(), Some(conv("task")));
        router.revert_assignment(moved).await;

        assert_eq!(a.conversation_id(), Some(conv("doc-5")));
        assert_eq!(router.conversation_for_document(DocumentId::new(5)).await, Some(conv("doc-5")));
        assert_eq!(bus.get_channel(&conv("task")).subscriber_count(), 0);
        let last = frames(&mut ra).pop().unwrap();
        assert_eq!(last["type"], "context.changed");
        assert_eq!(last["conversationId"], "doc-5");
    }

    #[tokio::test]
    async fn refresh_resubscribes_only_stale_routes() {
        let (router, bus) = router();
        let (x, mut rx) = ObserverConnection::channel("panel?conversationId=x", 16);
        let (y, _ry) = ObserverConnection::channel("panel?conversationId=y", 16);
        let _ = router.register_connection(x.clone()).await;
        let _ = router.register_connection(y).await;
        assert_eq!(router.refresh_conversation(&conv("x")).await, 0);

        assert!(bus.delete_channel(&conv("x"), true));
        assert_eq!(router.refresh_conversation(&conv("x")).await, 1);
        assert_eq!(router.refresh_conversation(&conv("y")).await, 0);
        assert_eq!(bus.get_channel(&conv("x")).subscriber_count(), 1);

        let _ = frames(&mut rx);
        let _ = bus.publish(&conv("x"), &ChannelEvent::new("run.started", conv("x")));
        assert_eq!(frames(&mut rx)[0]["type"], "run.started");
    }

    #[tokio::test]
    async fn group_broadcast_reaches_only_that_group() {
        let (router, _) = router();
        let (w1, mut r1) = ObserverConnection::channel("panel?groupId=w1", 16);
        let (w2, mut r2) = ObserverConnection::channel("panel?groupId=w2", 16);
        let _ = router.register_connection(w1).await;
        let _ = router.register_connection(w2).await;
        let _ = frames(&mut r1);
        let _ = frames(&mut r2);

        let sent = router
            .broadcast_to_document_group("w1", DocumentId::new(9), Some(conv("doc-9")))
            .await;
        assert_eq!(sent, 1);
        let got = frames(&mut r1);
        assert_eq!(got[0]["type"], "context.changed");
        assert_eq!(got[0]["documentId"], 9);
        assert!(frames(&mut r2).is_empty());

        let _ = router.broadcast_to_document_group("w1", DocumentId::new(9), None).await;
        assert_eq!(frames(&mut r1)[0]["type"], "context.cleared");
        assert_eq!(
            router.conversation_for_document(DocumentId::new(9)).await,
            Some(conv("doc-9"))
        );
    }
}
