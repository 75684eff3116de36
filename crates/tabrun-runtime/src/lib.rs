//! # tabrun-runtime
//!
//! The orchestration core: everything between "a trigger named a
//! conversation" and "the agent runner is acting on a locked document".
//!
//! - **Resource monitor**: hard caps on open documents and in-flight runs
//! - **Document context**: bounded LRU/TTL cache of document handles plus the
//!   conversation → document lock table
//! - **Channel bus**: per-conversation publish/subscribe with isolated subscribers
//! - **Conversation**: serializes runs for one id, supersedes stale runs via a
//!   generation counter, owns the persistent conversation buffer
//! - **Registry**: keyed conversation store with lifecycle fan-out
//! - **Orchestrator**: wires the above together, owns the background sweeps,
//!   and dispatches trigger intents

#![deny(unsafe_code)]

pub mod channel;
pub mod conversation;
pub mod document;
pub mod options;
pub mod orchestrator;
pub mod registry;
pub mod resource_monitor;
pub mod runner;
pub mod testing;

pub use channel::{Channel, ChannelBus, Subscription};
pub use conversation::{Conversation, ConversationDeps, ConversationStatus, RunOutcome, RunState};
pub use document::{DocumentContext, DocumentHandle, DocumentHost};
pub use options::{ConversationOptions, RunMetadata, RunOptions};
pub use orchestrator::{Intent, IntentResponse, Orchestrator};
pub use registry::ConversationRegistry;
pub use resource_monitor::{PoolUsage, ResourceMonitor, ResourceUsage};
pub use runner::{AgentRunner, ConversationBuffer, RunContext};
