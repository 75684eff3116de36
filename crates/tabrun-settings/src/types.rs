//! Settings types with compiled defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabrunSettings {
    /// Admission-control caps.
    pub resources: ResourceSettings,
    /// Document cache sizing and sweeping.
    pub documents: DocumentCacheSettings,
    /// Conversation defaults.
    pub conversations: ConversationSettings,
    /// Observer connection routing.
    pub router: RouterSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl TabrunSettings {
    /// Reject values the core cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let r = &self.resources;
        if r.max_documents == 0 {
            return Err(SettingsError::InvalidValue("resources.max_documents must be > 0".into()));
        }
        if r.max_executions == 0 {
            return Err(SettingsError::InvalidValue("resources.max_executions must be > 0".into()));
        }
        if !(r.warning_threshold > 0.0 && r.warning_threshold <= 1.0) {
            return Err(SettingsError::InvalidValue(format!(
                "resources.warning_threshold must be in (0, 1], got {}",
                r.warning_threshold
            )));
        }
        if r.reconcile_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "resources.reconcile_interval_ms must be > 0".into(),
            ));
        }
        let d = &self.documents;
        if d.max_size == 0 {
            return Err(SettingsError::InvalidValue("documents.max_size must be > 0".into()));
        }
        if d.ttl_ms == 0 || d.sweep_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "documents.ttl_ms and documents.sweep_interval_ms must be > 0".into(),
            ));
        }
        if self.conversations.default_conversation_id.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "conversations.default_conversation_id must not be blank".into(),
            ));
        }
        if self.router.send_buffer == 0 {
            return Err(SettingsError::InvalidValue("router.send_buffer must be > 0".into()));
        }
        Ok(())
    }
}

/// Caps enforced by the resource monitor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    /// Maximum number of simultaneously open documents.
    pub max_documents: usize,
    /// Maximum number of in-flight runs across all conversations.
    pub max_executions: usize,
    /// Utilization (0..=1) above which usage reports carry warnings.
    pub warning_threshold: f64,
    /// Minimum gap between two warnings for the same pool.
    pub warning_interval_ms: u64,
    /// How often registered documents are reconciled against the host.
    pub reconcile_interval_ms: u64,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            max_documents: 50,
            max_executions: 10,
            warning_threshold: 0.8,
            warning_interval_ms: 60_000,
            reconcile_interval_ms: 60_000,
        }
    }
}

impl ResourceSettings {
    /// Warning rate limit as a [`Duration`].
    pub fn warning_interval(&self) -> Duration {
        Duration::from_millis(self.warning_interval_ms)
    }

    /// Reconciliation period as a [`Duration`].
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

/// Document handle cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentCacheSettings {
    /// Maximum number of cached handles.
    pub max_size: usize,
    /// Idle time after which a handle is evicted by the sweep.
    pub ttl_ms: u64,
    /// Sweep period.
    pub sweep_interval_ms: u64,
}

impl Default for DocumentCacheSettings {
    fn default() -> Self {
        Self {
            max_size: 20,
            ttl_ms: 30 * 60 * 1000,
            sweep_interval_ms: 5 * 60 * 1000,
        }
    }
}

impl DocumentCacheSettings {
    /// Idle TTL as a [`Duration`].
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Sweep period as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Conversation defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    /// Id used when a trigger carries neither an id nor a document.
    pub default_conversation_id: String,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            default_conversation_id: "default".into(),
        }
    }
}

/// Observer connection routing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Frames buffered per observer before new ones are dropped.
    pub send_buffer: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self { send_buffer: 256 }
    }
}

/// Log output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level filter, overridden by `RUST_LOG`.
    pub level: String,
    /// `compact` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".into(),
            format: "compact".into(),
        }
    }
}
