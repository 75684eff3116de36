//! # tabrun-core
//!
//! Foundation types shared by every tabrun crate:
//!
//! - **Branded IDs**: `ConversationId`, `ConnectionId`, `RunId` as string
//!   newtypes, `DocumentId` as a numeric tab id
//! - **Errors**: the `CoreError` taxonomy via `thiserror`
//! - **Events**: `ChannelEvent` published on conversation channels and the
//!   `ContextNotification` pushed to observers
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;

pub use errors::{CoreError, Pool};
pub use ids::{ConnectionId, ConversationId, DocumentId, RunId};
