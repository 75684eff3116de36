//! Typed run options and per-run metadata.
//!
//! Trigger payloads arrive as loose JSON; they are narrowed into
//! [`RunOptions`] and validated once at the boundary so the rest of the core
//! only ever sees a known shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tabrun_core::{CoreError, DocumentId};

/// Which document(s) a run acts on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RunOptions {
    /// One document; `None` resolves through the lock table or focus.
    SingleDocument {
        /// Explicit target.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_document_id: Option<DocumentId>,
    },
    /// Several documents; the first is the primary target.
    MultiDocument {
        /// Targets in priority order.
        target_document_ids: Vec<DocumentId>,
    },
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::SingleDocument {
            target_document_id: None,
        }
    }
}

impl RunOptions {
    /// Single-document options with an explicit target.
    pub fn single(document_id: DocumentId) -> Self {
        Self::SingleDocument {
            target_document_id: Some(document_id),
        }
    }

    /// Reject shapes the run controller cannot act on.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::SingleDocument { .. } => Ok(()),
            Self::MultiDocument { target_document_ids } => {
                if target_document_ids.is_empty() {
                    return Err(CoreError::InvalidOptions(
                        "multi_document mode needs at least one target document".into(),
                    ));
                }
                let mut seen = target_document_ids.clone();
                seen.sort_unstable();
                seen.dedup();
                if seen.len() != target_document_ids.len() {
                    return Err(CoreError::InvalidOptions(
                        "multi_document targets must be distinct".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// The document the run locks.
    pub fn primary_document(&self) -> Option<DocumentId> {
        match self {
            Self::SingleDocument { target_document_id } => *target_document_id,
            Self::MultiDocument { target_document_ids } => target_document_ids.first().copied(),
        }
    }

    /// Every document named by these options.
    pub fn documents(&self) -> Vec<DocumentId> {
        match self {
            Self::SingleDocument { target_document_id } => {
                target_document_id.iter().copied().collect()
            }
            Self::MultiDocument { target_document_ids } => target_document_ids.clone(),
        }
    }
}

/// Caller-supplied metadata passed through to the runner untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    /// Conversation id embedded by the trigger, used during id resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Where the trigger came from (sidebar, shortcut, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Anything else.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Options held by a conversation across runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationOptions {
    /// Target selection.
    #[serde(default)]
    pub run: RunOptions,
    /// Metadata merged under each run's own metadata.
    #[serde(default)]
    pub metadata: RunMetadata,
    /// Verbose runner diagnostics.
    #[serde(default)]
    pub debug: bool,
}

impl ConversationOptions {
    /// Options targeting one document.
    pub fn for_document(document_id: DocumentId) -> Self {
        Self {
            run: RunOptions::single(document_id),
            ..Self::default()
        }
    }

    /// Validate the run options.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.run.validate()
    }

    /// Per-run metadata layered over the conversation defaults.
    pub fn merged_metadata(&self, run: &RunMetadata) -> RunMetadata {
        let mut extra = self.metadata.extra.clone();
        extra.extend(run.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        RunMetadata {
            conversation_id: run
                .conversation_id
                .clone()
                .or_else(|| self.metadata.conversation_id.clone()),
            source: run.source.clone().or_else(|| self.metadata.source.clone()),
            extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn run_options_tagged_by_mode() {
        let single: RunOptions =
            serde_json::from_value(json!({"mode": "single_document", "targetDocumentId": 7}))
                .unwrap();
        assert_eq!(single, RunOptions::single(DocumentId::new(7)));

        let multi: RunOptions = serde_json::from_value(json!({
            "mode": "multi_document",
            "targetDocumentIds": [3, 4]
        }))
        .unwrap();
        assert_eq!(multi.primary_document(), Some(DocumentId::new(3)));
        assert_eq!(multi.documents().len(), 2);
    }

    #[test]
    fn unknown_mode_rejected_at_parse() {
        let parsed: Result<RunOptions, _> = serde_json::from_value(json!({"mode": "every_tab"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn multi_document_validation() {
        let empty = RunOptions::MultiDocument {
            target_document_ids: vec![],
        };
        assert_matches!(empty.validate(), Err(CoreError::InvalidOptions(_)));

        let dupes = RunOptions::MultiDocument {
            target_document_ids: vec![DocumentId::new(1), DocumentId::new(1)],
        };
        assert_matches!(
            dupes.validate(),
            Err(CoreError::InvalidOptions(m)) if m.contains("distinct")
        );

        assert!(RunOptions::default().validate().is_ok());
    }

    #[test]
    fn metadata_keeps_unknown_fields() {
        let meta: RunMetadata = serde_json::from_value(json!({
            "conversationId": "c1",
            "source": "sidebar",
            "locale": "en"
        }))
        .unwrap();
        assert_eq!(meta.conversation_id.as_deref(), Some("c1"));
        assert_eq!(meta.extra["locale"], "en");
    }

    #[test]
    fn run_metadata_overrides_conversation_defaults() {
        let mut options = ConversationOptions::default();
        options.metadata.source = Some("shortcut".into());
        let _ = options.metadata.extra.insert("locale".into(), json!("en"));

        let mut run = RunMetadata::default();
        let _ = run.extra.insert("locale".into(), json!("de"));
        let merged = options.merged_metadata(&run);
        assert_eq!(merged.source.as_deref(), Some("shortcut"));
        assert_eq!(merged.extra["locale"], "de");
    }
}
