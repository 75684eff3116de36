//! Routing hints carried in an observer connection's identity.
//!
//! An identity looks like `sidepanel?conversationId=abc&documentId=7&groupId=w1`.
//! The query is form-urlencoded. Unknown keys are ignored, malformed
//! document ids are dropped.

use tabrun_core::{ConversationId, DocumentId};
use tracing::debug;
use url::form_urlencoded;

/// Parsed routing hints.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingHints {
    /// Observer kind (the part before `?`).
    pub kind: String,
    /// Explicitly requested conversation.
    pub conversation_id: Option<ConversationId>,
    /// Document the observer is attached to.
    pub document_id: Option<DocumentId>,
    /// Document group (browser window) the observer belongs to.
    pub group_id: Option<String>,
}

impl RoutingHints {
    /// Parse hints from a connection identity.
    pub fn parse(identity: &str) -> Self {
        let (kind, query) = identity.split_once('?').unwrap_or((identity, ""));
        let mut hints = Self {
            kind: kind.trim().to_owned(),
            ..Self::default()
        };
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match &*key {
                "conversationId" => hints.conversation_id = Some(ConversationId::from(value)),
                "documentId" => match value.parse() {
                    Ok(id) => hints.document_id = Some(id),
                    Err(_) => debug!(identity, value, "ignoring malformed documentId hint"),
                },
                "groupId" => hints.group_id = Some(value.to_owned()),
                _ => {}
            }
        }
        hints
    }

    /// Conversation id implied by the hints alone: explicit, else derived
    /// from the document.
    pub fn conversation(&self) -> Option<ConversationId> {
        self.conversation_id
            .clone()
            .or_else(|| self.document_id.map(ConversationId::for_document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_hints() {
        let hints = RoutingHints::parse("sidepanel?conversationId=abc&documentId=7&groupId=w1");
        assert_eq!(hints.kind, "sidepanel");
        assert_eq!(hints.conversation_id, Some(ConversationId::from("abc")));
        assert_eq!(hints.document_id, Some(DocumentId::new(7)));
        assert_eq!(hints.group_id.as_deref(), Some("w1"));
        assert_eq!(hints.conversation(), Some(ConversationId::from("abc")));
    }

    #[test]
    fn document_only_derives_conversation() {
        let hints = RoutingHints::parse("popup?documentId=42");
        assert_eq!(hints.conversation().as_ref().map(ConversationId::as_str), Some("doc-42"));
    }

    #[test]
    fn bare_identity_has_no_hints() {
        let hints = RoutingHints::parse("devtools");
        assert_eq!(hints.kind, "devtools");
        assert_eq!(hints.conversation(), None);
        assert_eq!(hints.group_id, None);
    }

    #[test]
    fn malformed_and_empty_values_ignored() {
        let hints = RoutingHints::parse("panel?documentId=tab&conversationId=&other=1&groupId");
        assert_eq!(hints.document_id, None);
        assert_eq!(hints.conversation_id, None);
        assert_eq!(hints.group_id, None);
    }

    #[test]
    fn percent_encoded_values_are_decoded() {
        let hints = RoutingHints::parse("panel?conversationId=trip%20plan&groupId=w%231");
        assert_eq!(hints.conversation_id, Some(ConversationId::from("trip plan")));
        assert_eq!(hints.group_id.as_deref(), Some("w#1"));

        let hints = RoutingHints::parse("panel?conversationId=a+b%26c&documentId=%37");
        assert_eq!(hints.conversation_id, Some(ConversationId::from("a b&c")));
        assert_eq!(hints.document_id, Some(DocumentId::new(7)));
    }
}
