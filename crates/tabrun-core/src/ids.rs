//! Branded ID newtypes.
//!
//! Conversations, observer connections and runs are identified by string
//! newtypes so a connection id can never be passed where a conversation id is
//! expected. Documents are browser tabs and keep the host's numeric id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{DEFAULT_CONVERSATION_ID, DOCUMENT_CONVERSATION_PREFIX};

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of one logical, resumable conversation.
    ConversationId
}

branded_id! {
    /// Identifier of an observer connection (side panel, popup, devtools pane).
    ConnectionId
}

branded_id! {
    /// Identifier of a single `run()` invocation.
    RunId
}

impl ConversationId {
    /// The fallback conversation id.
    #[must_use]
    pub fn default_id() -> Self {
        Self(DEFAULT_CONVERSATION_ID.to_owned())
    }

    /// Conversation id derived from a document (`doc-<id>`).
    #[must_use]
    pub fn for_document(document_id: DocumentId) -> Self {
        Self(format!("{DOCUMENT_CONVERSATION_PREFIX}{document_id}"))
    }

    /// The document this id was derived from, if it was derived at all.
    #[must_use]
    pub fn derived_document(&self) -> Option<DocumentId> {
        self.0
            .strip_prefix(DOCUMENT_CONVERSATION_PREFIX)
            .and_then(|rest| rest.parse().ok())
    }

    /// Resolve a conversation id from the available hints.
    ///
    /// Precedence: explicit id, then the id embedded in run metadata, then an
    /// id derived from the primary document, then [`Self::default_id`].
    /// Blank strings count as absent.
    #[must_use]
    pub fn resolve(
        explicit: Option<&str>,
        embedded: Option<&str>,
        primary_document: Option<DocumentId>,
    ) -> Self {
        fn non_blank(s: Option<&str>) -> Option<&str> {
            s.map(str::trim).filter(|s| !s.is_empty())
        }

        if let Some(id) = non_blank(explicit) {
            return Self::from(id);
        }
        if let Some(id) = non_blank(embedded) {
            return Self::from(id);
        }
        primary_document.map_or_else(Self::default_id, Self::for_document)
    }
}

/// Identifier of a document (browser tab) as reported by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(u64);

impl DocumentId {
    /// Wrap a host tab id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw host id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for DocumentId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl FromStr for DocumentId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
