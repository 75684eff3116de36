//! # tabrun-server
//!
//! Observer-facing edge of the tabrun core.
//!
//! - Observer connections: bounded JSON frame queues with drop accounting
//! - Routing hints parsed from a connection's identity string
//! - `ConnectionRouter`: binds observers to conversation channels and tracks
//!   which conversation each document is assigned to
//! - `Hub`: trigger dispatch plus browser lifecycle signals (document closed,
//!   focus changed) and process bootstrap

#![deny(unsafe_code)]

pub mod connection;
pub mod hub;
pub mod router;
pub mod routing;

pub use connection::ObserverConnection;
pub use hub::{Hub, bootstrap};
pub use router::{ConnectionRouter, DocumentMove};
pub use routing::RoutingHints;
